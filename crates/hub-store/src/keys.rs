//! Byte layout of the fjall keyspaces.

/// `data` keyspace: `key_utf8`
pub fn data_key(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

/// `fields` keyspace: `key_utf8 ++ \x00 ++ field_utf8`
///
/// The `\x00` delimiter guarantees that a prefix scan for mapping "foo\x00"
/// never bleeds into mapping "foobar\x00…" (UTF-8 keys cannot contain a null
/// byte, so the delimiter is unique).
pub fn field_key(key: &str, field: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 1 + field.len());
    buf.extend_from_slice(key.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(field.as_bytes());
    buf
}

/// Prefix covering every field of one mapping: `key_utf8 ++ \x00`
pub fn field_prefix(key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 1);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0x00);
    buf
}

/// Split a `fields` keyspace key back into `(mapping key, field)`.
pub fn split_field_key(raw: &[u8]) -> Option<(String, String)> {
    let null_pos = raw.iter().position(|&b| b == 0)?;
    let key = String::from_utf8(raw[..null_pos].to_vec()).ok()?;
    let field = String::from_utf8(raw[null_pos + 1..].to_vec()).ok()?;
    Some((key, field))
}

/// `ttl_index` keyspace: `expires_at_ns_be_i64(8) ++ key_utf8`
///
/// Big-endian i64 preserves sort order for expiry timestamps (all positive
/// Unix nanosecond values sort correctly in big-endian), so the sweeper can
/// stop at the first entry that has not expired yet.
pub fn ttl_index_key(expires_at_ns: i64, key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len());
    buf.extend_from_slice(&expires_at_ns.to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// Decode a `ttl_index` key into `(expires_at_ns, key)`.
pub fn split_ttl_index_key(raw: &[u8]) -> Option<(i64, String)> {
    if raw.len() < 8 {
        return None;
    }
    let expires_at_ns = i64::from_be_bytes(raw[..8].try_into().ok()?);
    let key = String::from_utf8(raw[8..].to_vec()).ok()?;
    Some((expires_at_ns, key))
}

/// `meta` keyspace: `label_utf8`
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_prefix_no_bleed() {
        let foo_prefix = field_prefix("foo");
        assert!(field_key("foo", "p1").starts_with(&foo_prefix));
        assert!(!field_key("foobar", "p1").starts_with(&foo_prefix));
    }

    #[test]
    fn field_key_splits_back() {
        let raw = field_key("cluster:proj_real:10.0.0.1", "proj-a");
        let (key, field) = split_field_key(&raw).unwrap();
        assert_eq!(key, "cluster:proj_real:10.0.0.1");
        assert_eq!(field, "proj-a");
        assert!(split_field_key(b"no-delimiter").is_none());
    }

    #[test]
    fn ttl_index_sorts_by_expiry_time() {
        let early = ttl_index_key(1_000_000_000, "z");
        let late = ttl_index_key(2_000_000_000, "a");
        assert!(early < late);
    }

    #[test]
    fn ttl_index_key_splits_back() {
        let raw = ttl_index_key(42, "lock:a");
        assert_eq!(split_ttl_index_key(&raw), Some((42, "lock:a".to_string())));
        assert!(split_ttl_index_key(b"short").is_none());
    }
}
