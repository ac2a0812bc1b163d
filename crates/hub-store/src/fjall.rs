use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hub_types::{now_ns, CasOutcome, HubError, KvEntry};

use crate::keys::{
    data_key, field_key, field_prefix, meta_key, split_field_key, split_ttl_index_key,
    ttl_index_key,
};
use crate::traits::CoordinationStore;

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, HubError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| HubError::Codec(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, HubError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| HubError::Codec(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> HubError {
    HubError::StoreUnavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallInner: keyspaces plus the write gate
// ---------------------------------------------------------------------------

struct FjallInner {
    db: fjall::Database,
    /// Plain values: `key_utf8` → bincode(KvEntry)
    data: fjall::Keyspace,
    /// Field mappings: `key_utf8 ++ \x00 ++ field_utf8` → value_utf8
    fields: fjall::Keyspace,
    /// Expiry index: `expires_at_ns_be_i64(8) ++ key_utf8` → b""
    ttl_index: fjall::Keyspace,
    /// Store metadata: `label_utf8` → bincode(value)
    meta: fjall::Keyspace,
    /// Serialises read-modify-write operations so that `set_if_absent`,
    /// `compare_and_swap` and friends are atomic within this process.
    gate: Mutex<()>,
}

impl FjallInner {
    fn live(&self, key: &str, now: i64) -> Result<Option<KvEntry>, HubError> {
        let entry = self
            .data
            .get(data_key(key))
            .map_err(fjall_err)?
            .map(|b| decode::<KvEntry>(&b))
            .transpose()?;
        Ok(entry.filter(|e| !e.is_expired(now)))
    }

    fn field_keys(&self, key: &str) -> Result<Vec<Vec<u8>>, HubError> {
        self.fields
            .prefix(field_prefix(key))
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }

    fn next_version(&self) -> Result<u64, HubError> {
        match self.meta.get(meta_key("next_version")).map_err(fjall_err)? {
            Some(b) => decode::<u64>(&b),
            None => Ok(1),
        }
    }

    /// Write a plain value, replacing any previous value or mapping at `key`.
    /// Caller must hold the gate.
    fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        now: i64,
    ) -> Result<u64, HubError> {
        let previous = self
            .data
            .get(data_key(key))
            .map_err(fjall_err)?
            .map(|b| decode::<KvEntry>(&b))
            .transpose()?;
        let version = self.next_version()?;
        let created_at_ns = previous
            .as_ref()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.created_at_ns)
            .unwrap_or(now);
        let expires_at_ns = ttl.map(|d| now.saturating_add(d.as_nanos() as i64));
        let entry = KvEntry {
            key: key.to_string(),
            value,
            version,
            created_at_ns,
            modified_at_ns: now,
            expires_at_ns,
        };

        let stale_fields = self.field_keys(key)?;
        let mut batch = self.db.batch();
        batch.insert(&self.data, data_key(key), encode(&entry)?);
        if let Some(exp) = expires_at_ns {
            batch.insert(&self.ttl_index, ttl_index_key(exp, key), Vec::new());
        }
        // Remove the TTL index entry belonging to the previous expiry.
        if let Some(old_exp) = previous.as_ref().and_then(|e| e.expires_at_ns) {
            if Some(old_exp) != expires_at_ns {
                batch.remove(&self.ttl_index, ttl_index_key(old_exp, key));
            }
        }
        for k in stale_fields {
            batch.remove(&self.fields, k);
        }
        batch.insert(&self.meta, meta_key("next_version"), encode(&(version + 1))?);
        batch.commit().map_err(fjall_err)?;
        Ok(version)
    }

    /// Remove the plain value at `key` (and its TTL index entry).
    /// Caller must hold the gate.
    fn remove_data(&self, key: &str) -> Result<Option<KvEntry>, HubError> {
        let previous = self
            .data
            .get(data_key(key))
            .map_err(fjall_err)?
            .map(|b| decode::<KvEntry>(&b))
            .transpose()?;
        if let Some(ref entry) = previous {
            let mut batch = self.db.batch();
            batch.remove(&self.data, data_key(key));
            if let Some(exp) = entry.expires_at_ns {
                batch.remove(&self.ttl_index, ttl_index_key(exp, key));
            }
            batch.commit().map_err(fjall_err)?;
        }
        Ok(previous)
    }
}

// ---------------------------------------------------------------------------
// FjallStore
// ---------------------------------------------------------------------------

/// Durable `CoordinationStore` backed by fjall.
///
/// All four keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. Blocking I/O is wrapped in
/// `tokio::task::spawn_blocking`. Atomicity of conditional writes holds for all
/// tasks sharing this handle, i.e. for nodes co-hosted in one process.
#[derive(Clone)]
pub struct FjallStore {
    inner: Arc<FjallInner>,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Self, HubError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let data =
            db.keyspace("data", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let fields =
            db.keyspace("fields", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let ttl_index =
            db.keyspace("ttl_index", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        tracing::info!(path = %path.display(), "fjall coordination store opened");
        Ok(FjallStore {
            inner: Arc::new(FjallInner {
                db,
                data,
                fields,
                ttl_index,
                meta,
                gate: Mutex::new(()),
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, HubError>
    where
        T: Send + 'static,
        F: FnOnce(&FjallInner) -> Result<T, HubError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| HubError::StoreUnavailable(e.to_string()))?
    }
}

fn gate_err<T>(_: T) -> HubError {
    HubError::StoreUnavailable("fjall write gate poisoned".into())
}

impl CoordinationStore for FjallStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, HubError> {
        let key = key.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            let now = now_ns();
            if s.live(&key, now)?.is_some() || !s.field_keys(&key)?.is_empty() {
                return Ok(false);
            }
            s.write(&key, value, ttl, now)?;
            Ok(true)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, HubError> {
        let key = key.to_string();
        self.blocking(move |s| s.live(&key, now_ns())).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, HubError> {
        let key = key.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            s.write(&key, value, ttl, now_ns())
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, HubError> {
        let key = key.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            let now = now_ns();
            let current = s.live(&key, now)?;
            let matches = current.as_ref().map(|e| e.value == expected).unwrap_or(false);
            if matches {
                s.write(&key, new_value, ttl, now)?;
            }
            Ok(CasOutcome { success: matches, current })
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: Vec<u8>) -> Result<bool, HubError> {
        let key = key.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            let matches = s
                .live(&key, now_ns())?
                .map(|e| e.value == expected)
                .unwrap_or(false);
            if matches {
                s.remove_data(&key)?;
            }
            Ok(matches)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, HubError> {
        let key = key.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            let now = now_ns();
            let removed_data = s
                .remove_data(&key)?
                .map(|e| !e.is_expired(now))
                .unwrap_or(false);
            let field_keys = s.field_keys(&key)?;
            let removed_fields = !field_keys.is_empty();
            if removed_fields {
                let mut batch = s.db.batch();
                for k in field_keys {
                    batch.remove(&s.fields, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(removed_data || removed_fields)
        })
        .await
    }

    async fn get_all_fields(&self, key: &str) -> Result<BTreeMap<String, String>, HubError> {
        let key = key.to_string();
        self.blocking(move |s| {
            s.fields
                .prefix(field_prefix(&key))
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, v)| {
                        let (_, field) = split_field_key(&k)
                            .ok_or_else(|| HubError::Codec("malformed field key".into()))?;
                        let value = String::from_utf8(v.to_vec())
                            .map_err(|e| HubError::Codec(e.to_string()))?;
                        Ok((field, value))
                    })
                })
                .collect()
        })
        .await
    }

    async fn set_field(&self, key: &str, field: &str, value: String) -> Result<(), HubError> {
        let key = key.to_string();
        let field = field.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            s.remove_data(&key)?;
            s.fields
                .insert(field_key(&key, &field), value.into_bytes())
                .map_err(fjall_err)
        })
        .await
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, HubError> {
        let key = key.to_string();
        let field = field.to_string();
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            let raw = field_key(&key, &field);
            let found = s.fields.get(&raw).map_err(fjall_err)?.is_some();
            if found {
                s.fields.remove(raw).map_err(fjall_err)?;
            }
            Ok(found)
        })
        .await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, HubError> {
        let prefix = prefix.to_string();
        self.blocking(move |s| {
            let now = now_ns();
            let mut keys = Vec::new();
            for guard in s.data.prefix(data_key(&prefix)) {
                let (_, v) = guard.into_inner().map_err(fjall_err)?;
                let entry = decode::<KvEntry>(&v)?;
                if !entry.is_expired(now) {
                    keys.push(entry.key);
                }
            }
            for guard in s.fields.prefix(prefix.as_bytes().to_vec()) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                if let Some((key, _)) = split_field_key(&k) {
                    keys.push(key);
                }
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, HubError> {
        self.blocking(move |s| {
            let _gate = s.gate.lock().map_err(gate_err)?;
            let now = now_ns();

            // The index is sorted by expiry, so stop at the first live entry.
            let mut due: Vec<(Vec<u8>, String)> = Vec::new();
            for guard in s.ttl_index.iter() {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let Some((expires_at_ns, key)) = split_ttl_index_key(&k) else {
                    continue;
                };
                if expires_at_ns > now {
                    break;
                }
                due.push((k.to_vec(), key));
            }

            let mut removed = 0;
            let mut batch = s.db.batch();
            for (raw, key) in due {
                batch.remove(&s.ttl_index, raw);
                let current = s
                    .data
                    .get(data_key(&key))
                    .map_err(fjall_err)?
                    .map(|b| decode::<KvEntry>(&b))
                    .transpose()?;
                if current.map(|e| e.is_expired(now)).unwrap_or(false) {
                    batch.remove(&s.data, data_key(&key));
                    removed += 1;
                }
            }
            batch.commit().map_err(fjall_err)?;
            Ok(removed)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
