use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::traits::CoordinationStore;

/// Sweep interval used when none is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically removes expired keys from a store backend.
///
/// Reads never observe expired keys regardless of whether the sweeper runs;
/// the sweeper only reclaims space.
pub struct TtlSweeper<S> {
    store: Arc<S>,
    interval: Duration,
}

impl<S: CoordinationStore> TtlSweeper<S> {
    pub fn new(store: Arc<S>, interval: Duration) -> Self {
        TtlSweeper { store, interval }
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "expired keys purged"),
                Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
            }
        }
        tracing::debug!("ttl sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;

    #[tokio::test]
    async fn sweeper_purges_then_stops() {
        let store = Arc::new(MemStore::new());
        store
            .set("gone", b"x".to_vec(), Some(Duration::from_millis(5)))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(TtlSweeper::new(store.clone(), Duration::from_millis(10)).run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper stops on shutdown")
            .unwrap();
    }
}
