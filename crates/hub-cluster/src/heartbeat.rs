use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use hub_store::CoordinationStore;
use hub_types::{now_ns, HubError, NodeId};

use crate::codec::{decode, encode};
use crate::keys::{
    applied_version_key, heartbeat_key, suffix, APPLIED_VERSION_PREFIX, EXPECTED_STATE_PREFIX,
    HEARTBEAT_PREFIX, REAL_STATE_PREFIX, STATE_TIMESTAMP_PREFIX,
};
use crate::project_state::ProjectStateTracker;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HeartbeatRecord {
    pub node_id: NodeId,
    pub address: String,
    pub last_seen_ns: i64,
    pub started_at_ns: i64,
}

/// Publishes this node's liveness. The key expires after `timeout` without
/// a beat, which is what makes a node "dead" to everyone else.
pub struct Heartbeat<S> {
    store: Arc<S>,
    node_id: NodeId,
    address: String,
    started_at_ns: i64,
    interval: Duration,
    timeout: Duration,
}

impl<S: CoordinationStore> Heartbeat<S> {
    pub fn new(
        store: Arc<S>,
        node_id: NodeId,
        address: String,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Heartbeat { store, node_id, address, started_at_ns: now_ns(), interval, timeout }
    }

    pub async fn beat(&self) -> Result<(), HubError> {
        let record = HeartbeatRecord {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            last_seen_ns: now_ns(),
            started_at_ns: self.started_at_ns,
        };
        self.store
            .set(&heartbeat_key(&self.node_id), encode(&record)?, Some(self.timeout))
            .await?;
        Ok(())
    }

    /// Beat every `interval` until `shutdown` flips. Failures are logged and
    /// retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
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
            if let Err(e) = self.beat().await {
                tracing::warn!(node = %self.node_id, error = %e, "heartbeat failed");
            }
        }
        tracing::debug!(node = %self.node_id, "heartbeat stopped");
    }

    /// Remove this node's heartbeat so it drops out of the node list at once.
    pub async fn clear(&self) -> Result<(), HubError> {
        self.store.delete(&heartbeat_key(&self.node_id)).await.map(|_| ())
    }
}

/// Live heartbeat records, sorted by node ID. Undecodable records are
/// skipped.
pub async fn known_nodes<S: CoordinationStore>(store: &S) -> Result<Vec<HeartbeatRecord>, HubError> {
    let mut out = Vec::new();
    for key in store.scan_keys(HEARTBEAT_PREFIX).await? {
        let Some(node) = suffix(HEARTBEAT_PREFIX, &key) else { continue };
        let Some(entry) = store.get(&key).await? else { continue };
        match decode::<HeartbeatRecord>(&entry.value) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!(node, error = %e, "undecodable heartbeat"),
        }
    }
    Ok(out)
}

/// Delete the state maps and applied cursor of every node that still has
/// them but no live heartbeat. `keep` is never reaped. Returns the reaped
/// node IDs.
pub async fn reap_departed<S: CoordinationStore>(
    store: &S,
    tracker: &ProjectStateTracker<S>,
    keep: &str,
) -> Result<Vec<NodeId>, HubError> {
    let live: BTreeSet<NodeId> = known_nodes(store).await?.into_iter().map(|r| r.node_id).collect();
    let mut departed = BTreeSet::new();
    for prefix in [REAL_STATE_PREFIX, STATE_TIMESTAMP_PREFIX, EXPECTED_STATE_PREFIX, APPLIED_VERSION_PREFIX] {
        for key in store.scan_keys(prefix).await? {
            if let Some(node) = suffix(prefix, &key) {
                if node != keep && !live.contains(node) {
                    departed.insert(node.to_string());
                }
            }
        }
    }
    for node in &departed {
        tracker.forget_node(node).await?;
        store.delete(&applied_version_key(node)).await?;
        tracing::info!(node = %node, "departed node state removed");
    }
    Ok(departed.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{expected_state_key, real_state_key};
    use hub_store::MemStore;
    use hub_types::ProjectStatus;

    fn heartbeat(store: &Arc<MemStore>, node: &str, timeout: Duration) -> Heartbeat<MemStore> {
        Heartbeat::new(
            store.clone(),
            node.to_string(),
            format!("http://{node}"),
            Duration::from_millis(10),
            timeout,
        )
    }

    #[tokio::test]
    async fn beat_registers_node() {
        let store = Arc::new(MemStore::new());
        heartbeat(&store, "n2", Duration::from_secs(30)).beat().await.unwrap();
        heartbeat(&store, "n1", Duration::from_secs(30)).beat().await.unwrap();

        let nodes = known_nodes(store.as_ref()).await.unwrap();
        let ids: Vec<_> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(nodes[0].address, "http://n1");
    }

    #[tokio::test]
    async fn silent_node_expires() {
        let store = Arc::new(MemStore::new());
        heartbeat(&store, "n1", Duration::from_millis(20)).beat().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(known_nodes(store.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_keeps_node_alive_until_shutdown() {
        let store = Arc::new(MemStore::new());
        let hb = Arc::new(heartbeat(&store, "n1", Duration::from_millis(50)));
        let (tx, rx) = watch::channel(false);
        let task = {
            let hb = hb.clone();
            tokio::spawn(async move { hb.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(known_nodes(store.as_ref()).await.unwrap().len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
        hb.clear().await.unwrap();
        assert!(known_nodes(store.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn departed_nodes_are_reaped() {
        let store = Arc::new(MemStore::new());
        heartbeat(&store, "n2", Duration::from_secs(30)).beat().await.unwrap();
        for node in ["n2", "gone"] {
            let tracker = ProjectStateTracker::new(store.clone(), node.to_string());
            tracker.set_real_state(node, "p1", ProjectStatus::Running).await.unwrap();
            tracker.set_expected_state(node, "p1", true).await.unwrap();
            store.set(&applied_version_key(node), b"1.3".to_vec(), None).await.unwrap();
        }
        let leader = ProjectStateTracker::new(store.clone(), "n1".to_string());
        leader.set_real_state("n1", "p1", ProjectStatus::Running).await.unwrap();

        let reaped = reap_departed(store.as_ref(), &leader, "n1").await.unwrap();
        assert_eq!(reaped, vec!["gone".to_string()]);
        assert!(store.get_all_fields(&real_state_key("gone")).await.unwrap().is_empty());
        assert!(store.get_all_fields(&expected_state_key("gone")).await.unwrap().is_empty());
        assert!(leader.get_timestamps("gone").await.unwrap().is_empty());
        assert!(store.get(&applied_version_key("gone")).await.unwrap().is_none());

        // Live nodes and the caller keep their state.
        assert_eq!(leader.get_real_states("n2").await.unwrap().len(), 1);
        assert_eq!(leader.get_real_states("n1").await.unwrap().len(), 1);
        assert!(store.get(&applied_version_key("n2")).await.unwrap().is_some());
        assert!(reap_departed(store.as_ref(), &leader, "n1").await.unwrap().is_empty());
    }
}
