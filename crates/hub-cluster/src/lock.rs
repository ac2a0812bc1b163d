use std::sync::Arc;
use std::time::Duration;

use hub_store::CoordinationStore;
use hub_types::{now_ns, HubError, NodeId};

use crate::codec::{decode, encode};
use crate::keys::{lock_key, suffix, LOCK_PREFIX};

/// Value stored under `cluster:lock:{name}`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LockRecord {
    pub holder: NodeId,
    /// Distinguishes two acquisitions by the same holder.
    pub token: String,
    pub acquired_at_ns: i64,
}

/// A held lock. Dropping it does not release anything; the TTL does.
#[derive(Debug, Clone)]
pub struct LockLease {
    pub name: String,
    pub owner: NodeId,
    pub token: String,
    pub acquired_at_ns: i64,
    pub ttl: Duration,
    record_bytes: Vec<u8>,
}

impl LockLease {
    /// How long the lock can outlive a crashed holder.
    pub fn max_staleness(&self) -> Duration {
        self.ttl
    }

    fn stale(&self) -> HubError {
        HubError::StaleLock { resource: self.name.clone(), owner: self.owner.clone() }
    }
}

/// Named mutual exclusion over the coordination store.
///
/// Every call is a single attempt; callers decide whether to retry.
pub struct DistributedLock<S> {
    store: Arc<S>,
}

impl<S> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        DistributedLock { store: self.store.clone() }
    }
}

impl<S: CoordinationStore> DistributedLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        DistributedLock { store }
    }

    /// `Ok(None)` when somebody else holds `name`.
    pub async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, HubError> {
        let record = LockRecord {
            holder: owner.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at_ns: now_ns(),
        };
        let bytes = encode(&record)?;
        if !self.store.set_if_absent(&lock_key(name), bytes.clone(), Some(ttl)).await? {
            tracing::debug!(lock = name, owner, "lock busy");
            return Ok(None);
        }
        tracing::debug!(lock = name, owner, ttl_ms = ttl.as_millis() as u64, "lock acquired");
        Ok(Some(LockLease {
            name: name.to_string(),
            owner: record.holder,
            token: record.token,
            acquired_at_ns: record.acquired_at_ns,
            ttl,
            record_bytes: bytes,
        }))
    }

    /// Like [`acquire`](Self::acquire) but reports a busy lock as `LockBusy`
    /// naming the current holder.
    pub async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockLease, HubError> {
        if let Some(lease) = self.acquire(name, owner, ttl).await? {
            return Ok(lease);
        }
        let holder = self.holder(name).await.ok().flatten().map(|r| r.holder);
        Err(HubError::LockBusy { resource: name.to_string(), holder })
    }

    pub async fn holder(&self, name: &str) -> Result<Option<LockRecord>, HubError> {
        match self.store.get(&lock_key(name)).await? {
            Some(entry) => Ok(Some(decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Extend the lease by its TTL. Fails with `StaleLock` if the lock expired
    /// or was taken over.
    pub async fn refresh(&self, lease: &LockLease) -> Result<(), HubError> {
        let outcome = self
            .store
            .compare_and_swap(
                &lock_key(&lease.name),
                lease.record_bytes.clone(),
                lease.record_bytes.clone(),
                Some(lease.ttl),
            )
            .await?;
        if !outcome.success {
            tracing::warn!(lock = %lease.name, owner = %lease.owner, "lock lost before refresh");
            return Err(lease.stale());
        }
        Ok(())
    }

    /// Delete the lock if this lease still owns it. A lost lease is reported
    /// as `StaleLock` and leaves the current holder untouched.
    pub async fn release(&self, lease: LockLease) -> Result<(), HubError> {
        let deleted = self
            .store
            .compare_and_delete(&lock_key(&lease.name), lease.record_bytes.clone())
            .await?;
        if !deleted {
            tracing::warn!(lock = %lease.name, owner = %lease.owner, "lock lost before release");
            return Err(lease.stale());
        }
        tracing::debug!(lock = %lease.name, owner = %lease.owner, "lock released");
        Ok(())
    }

    /// All currently held locks, by name.
    pub async fn list(&self) -> Result<Vec<(String, LockRecord)>, HubError> {
        let mut out = Vec::new();
        for key in self.store.scan_keys(LOCK_PREFIX).await? {
            let Some(name) = suffix(LOCK_PREFIX, &key) else { continue };
            // The lock may expire between scan and read.
            let Some(entry) = self.store.get(&key).await? else { continue };
            match decode::<LockRecord>(&entry.value) {
                Ok(record) => out.push((name.to_string(), record)),
                Err(e) => tracing::warn!(lock = name, error = %e, "undecodable lock record"),
            }
        }
        Ok(out)
    }
}
