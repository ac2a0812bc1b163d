//! Key layout of the coordination store.

use hub_types::InstructionVersion;

/// `cluster:proj_real:{node}` → { project: status }
pub const REAL_STATE_PREFIX: &str = "cluster:proj_real:";
/// `cluster:proj_ts:{node}` → { project: unix_ns }
pub const STATE_TIMESTAMP_PREFIX: &str = "cluster:proj_ts:";
/// `cluster:proj_states:{node}` → { project: "running" }; absent means stopped.
pub const EXPECTED_STATE_PREFIX: &str = "cluster:proj_states:";
pub const INSTRUCTION_VERSION_KEY: &str = "cluster:instruction:version";
pub const INSTRUCTION_ENTRY_PREFIX: &str = "cluster:instruction:entry:";
pub const LOCK_PREFIX: &str = "cluster:lock:";
pub const EXECUTION_MARKER_PREFIX: &str = "cluster:exec:";
pub const APPLIED_VERSION_PREFIX: &str = "cluster:applied:";
pub const HEARTBEAT_PREFIX: &str = "cluster:heartbeat:";
pub const LEADER_KEY: &str = "cluster:leader";

pub fn real_state_key(node_id: &str) -> String {
    format!("{REAL_STATE_PREFIX}{node_id}")
}

pub fn state_timestamp_key(node_id: &str) -> String {
    format!("{STATE_TIMESTAMP_PREFIX}{node_id}")
}

pub fn expected_state_key(node_id: &str) -> String {
    format!("{EXPECTED_STATE_PREFIX}{node_id}")
}

/// Zero-padded so that a prefix scan returns instructions in version order.
pub fn instruction_key(version: InstructionVersion) -> String {
    format!("{INSTRUCTION_ENTRY_PREFIX}{:020}.{:020}", version.epoch, version.sequence)
}

pub fn parse_instruction_key(key: &str) -> Option<InstructionVersion> {
    key.strip_prefix(INSTRUCTION_ENTRY_PREFIX)?.parse().ok()
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

pub fn execution_marker_key(node_id: &str) -> String {
    format!("{EXECUTION_MARKER_PREFIX}{node_id}")
}

pub fn applied_version_key(node_id: &str) -> String {
    format!("{APPLIED_VERSION_PREFIX}{node_id}")
}

pub fn heartbeat_key(node_id: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{node_id}")
}

/// Strip `prefix` from a scanned key, yielding the node ID / resource name.
pub fn suffix<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_keys_sort_by_version() {
        let a = instruction_key(InstructionVersion::new(1, 9));
        let b = instruction_key(InstructionVersion::new(1, 10));
        let c = instruction_key(InstructionVersion::new(2, 1));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn instruction_key_parses_back() {
        let v = InstructionVersion::new(3, 17);
        assert_eq!(parse_instruction_key(&instruction_key(v)), Some(v));
        assert_eq!(parse_instruction_key("cluster:lock:x"), None);
    }

    #[test]
    fn suffix_extracts_node_id() {
        let key = execution_marker_key("10.0.0.2:8080");
        assert_eq!(suffix(EXECUTION_MARKER_PREFIX, &key), Some("10.0.0.2:8080"));
        assert_eq!(suffix(EXECUTION_MARKER_PREFIX, EXECUTION_MARKER_PREFIX), None);
    }

    #[test]
    fn per_node_keys_do_not_collide() {
        let node = "n1";
        let keys = [
            real_state_key(node),
            state_timestamp_key(node),
            expected_state_key(node),
            execution_marker_key(node),
            applied_version_key(node),
            heartbeat_key(node),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert!(!a.starts_with(b.as_str()) && !b.starts_with(a.as_str()));
            }
        }
    }
}
