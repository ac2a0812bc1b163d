use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use hub_types::{now_ns, CasOutcome, HubError, KvEntry};

use crate::traits::CoordinationStore;

fn expiry(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now.saturating_add(d.as_nanos() as i64))
}

struct MemInner {
    data: BTreeMap<String, KvEntry>,
    fields: BTreeMap<String, BTreeMap<String, String>>,
    next_version: u64,
}

impl MemInner {
    /// Live entry for `key`; expired entries are treated as absent.
    fn live(&self, key: &str, now: i64) -> Option<&KvEntry> {
        self.data.get(key).filter(|e| !e.is_expired(now))
    }

    fn write(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>, now: i64) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        let created_at_ns = self.live(key, now).map(|e| e.created_at_ns).unwrap_or(now);
        self.data.insert(
            key.to_string(),
            KvEntry {
                key: key.to_string(),
                value,
                version,
                created_at_ns,
                modified_at_ns: now,
                expires_at_ns: expiry(now, ttl),
            },
        );
        version
    }
}

/// In-memory `CoordinationStore` backed by `BTreeMap`s.
///
/// Clones share the same underlying maps, so one `MemStore` can stand in for
/// the shared store of a whole simulated cluster. Not persisted.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            inner: Arc::new(RwLock::new(MemInner {
                data: BTreeMap::new(),
                fields: BTreeMap::new(),
                next_version: 1,
            })),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationStore for MemStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, HubError> {
        let mut g = self.inner.write().await;
        let now = now_ns();
        if g.live(key, now).is_some() || g.fields.contains_key(key) {
            return Ok(false);
        }
        g.write(key, value, ttl, now);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, HubError> {
        Ok(self.inner.read().await.live(key, now_ns()).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, HubError> {
        let mut g = self.inner.write().await;
        g.fields.remove(key);
        Ok(g.write(key, value, ttl, now_ns()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, HubError> {
        let mut g = self.inner.write().await;
        let now = now_ns();
        let current = g.live(key, now).cloned();
        let matches = current.as_ref().map(|e| e.value == expected).unwrap_or(false);
        if matches {
            g.write(key, new_value, ttl, now);
        }
        Ok(CasOutcome { success: matches, current })
    }

    async fn compare_and_delete(&self, key: &str, expected: Vec<u8>) -> Result<bool, HubError> {
        let mut g = self.inner.write().await;
        let matches = g.live(key, now_ns()).map(|e| e.value == expected).unwrap_or(false);
        if matches {
            g.data.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> Result<bool, HubError> {
        let mut g = self.inner.write().await;
        let now = now_ns();
        let live = g.live(key, now).is_some();
        let removed_data = g.data.remove(key).is_some() && live;
        let removed_fields = g.fields.remove(key).is_some();
        Ok(removed_data || removed_fields)
    }

    async fn get_all_fields(&self, key: &str) -> Result<BTreeMap<String, String>, HubError> {
        Ok(self.inner.read().await.fields.get(key).cloned().unwrap_or_default())
    }

    async fn set_field(&self, key: &str, field: &str, value: String) -> Result<(), HubError> {
        let mut g = self.inner.write().await;
        g.data.remove(key);
        g.fields
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, HubError> {
        let mut g = self.inner.write().await;
        let Some(map) = g.fields.get_mut(key) else {
            return Ok(false);
        };
        let found = map.remove(field).is_some();
        if map.is_empty() {
            g.fields.remove(key);
        }
        Ok(found)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, HubError> {
        let g = self.inner.read().await;
        let now = now_ns();
        let mut keys: Vec<String> = g
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(
            g.fields
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone()),
        );
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<usize, HubError> {
        let mut g = self.inner.write().await;
        let now = now_ns();
        let before = g.data.len();
        g.data.retain(|_, e| !e.is_expired(now));
        Ok(before - g.data.len())
    }
}
