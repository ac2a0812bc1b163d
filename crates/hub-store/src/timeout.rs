use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use hub_types::{CasOutcome, HubError, KvEntry};

use crate::traits::CoordinationStore;

/// Wraps a backend so that no store call blocks longer than `limit`.
///
/// An elapsed call is reported as `StoreUnavailable`; the underlying request
/// may still complete on the backend.
pub struct TimeoutStore<S> {
    inner: S,
    limit: Duration,
}

impl<S: CoordinationStore> TimeoutStore<S> {
    pub fn new(inner: S, limit: Duration) -> Self {
        TimeoutStore { inner, limit }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, HubError>>,
    ) -> Result<T, HubError> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(op, limit_ms = self.limit.as_millis() as u64, "store call timed out");
                Err(HubError::StoreUnavailable(format!(
                    "{op} timed out after {}ms",
                    self.limit.as_millis()
                )))
            }
        }
    }
}

impl<S: CoordinationStore> CoordinationStore for TimeoutStore<S> {
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, HubError> {
        self.bounded("set_if_absent", self.inner.set_if_absent(key, value, ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, HubError> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<u64, HubError> {
        self.bounded("set", self.inner.set(key, value, ttl)).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Vec<u8>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, HubError> {
        self.bounded(
            "compare_and_swap",
            self.inner.compare_and_swap(key, expected, new_value, ttl),
        )
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: Vec<u8>) -> Result<bool, HubError> {
        self.bounded("compare_and_delete", self.inner.compare_and_delete(key, expected)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, HubError> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn get_all_fields(&self, key: &str) -> Result<BTreeMap<String, String>, HubError> {
        self.bounded("get_all_fields", self.inner.get_all_fields(key)).await
    }

    async fn set_field(&self, key: &str, field: &str, value: String) -> Result<(), HubError> {
        self.bounded("set_field", self.inner.set_field(key, field, value)).await
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, HubError> {
        self.bounded("delete_field", self.inner.delete_field(key, field)).await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, HubError> {
        self.bounded("scan_keys", self.inner.scan_keys(prefix)).await
    }

    async fn purge_expired(&self) -> Result<usize, HubError> {
        self.bounded("purge_expired", self.inner.purge_expired()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;

    /// Backend whose reads never complete.
    struct Hanging(MemStore);

    impl CoordinationStore for Hanging {
        async fn set_if_absent(&self, k: &str, v: Vec<u8>, t: Option<Duration>) -> Result<bool, HubError> {
            self.0.set_if_absent(k, v, t).await
        }
        async fn get(&self, _key: &str) -> Result<Option<KvEntry>, HubError> {
            std::future::pending().await
        }
        async fn set(&self, k: &str, v: Vec<u8>, t: Option<Duration>) -> Result<u64, HubError> {
            self.0.set(k, v, t).await
        }
        async fn compare_and_swap(&self, k: &str, e: Vec<u8>, n: Vec<u8>, t: Option<Duration>) -> Result<CasOutcome, HubError> {
            self.0.compare_and_swap(k, e, n, t).await
        }
        async fn compare_and_delete(&self, k: &str, e: Vec<u8>) -> Result<bool, HubError> {
            self.0.compare_and_delete(k, e).await
        }
        async fn delete(&self, k: &str) -> Result<bool, HubError> {
            self.0.delete(k).await
        }
        async fn get_all_fields(&self, k: &str) -> Result<BTreeMap<String, String>, HubError> {
            self.0.get_all_fields(k).await
        }
        async fn set_field(&self, k: &str, f: &str, v: String) -> Result<(), HubError> {
            self.0.set_field(k, f, v).await
        }
        async fn delete_field(&self, k: &str, f: &str) -> Result<bool, HubError> {
            self.0.delete_field(k, f).await
        }
        async fn scan_keys(&self, p: &str) -> Result<Vec<String>, HubError> {
            self.0.scan_keys(p).await
        }
        async fn purge_expired(&self) -> Result<usize, HubError> {
            self.0.purge_expired().await
        }
    }

    #[tokio::test]
    async fn hanging_call_becomes_store_unavailable() {
        let store = TimeoutStore::new(Hanging(MemStore::new()), Duration::from_millis(20));
        store.set("k", b"v".to_vec(), None).await.unwrap();

        let err = store.get("k").await.unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
    }
}
