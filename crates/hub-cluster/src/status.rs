use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hub_store::CoordinationStore;
use hub_types::{now_ns, HubError, NodeId, ProjectStatus, Role};

use crate::heartbeat::{known_nodes, HeartbeatRecord};
use crate::keys::{applied_version_key, execution_marker_key, suffix, EXECUTION_MARKER_PREFIX};
use crate::leader::{Leader, LeaderSource};
use crate::project_state::ProjectStateTracker;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProjectStateView {
    pub id: String,
    /// `None` when the node has not reported this project yet.
    pub status: Option<ProjectStatus>,
    pub status_changed_at_ns: Option<i64>,
    pub expected_running: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub address: Option<String>,
    pub role: Role,
    pub alive: bool,
    pub last_seen_ns: Option<i64>,
    pub executing: bool,
    pub applied_version: Option<String>,
    pub projects: Vec<ProjectStateView>,
    /// Set when this node's state could not be read.
    pub state_error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClusterSnapshot {
    pub self_id: NodeId,
    pub leader_id: Option<NodeId>,
    pub self_role: Role,
    pub taken_at_ns: i64,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NodeExecution {
    pub executing: bool,
    pub role: Role,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FollowerExecutionStatus {
    pub node_status: BTreeMap<NodeId, NodeExecution>,
    pub total_nodes: usize,
    pub executing_followers: usize,
    pub idle_followers: usize,
    pub can_compact: bool,
}

/// Builds read-only views of the cluster straight from the store. Nothing is
/// cached; every call re-reads.
pub struct ClusterStatusAggregator<S> {
    store: Arc<S>,
    node_id: NodeId,
    leader: Arc<Leader<S>>,
    tracker: Arc<ProjectStateTracker<S>>,
}

impl<S: CoordinationStore> ClusterStatusAggregator<S> {
    pub fn new(
        store: Arc<S>,
        node_id: NodeId,
        leader: Arc<Leader<S>>,
        tracker: Arc<ProjectStateTracker<S>>,
    ) -> Self {
        ClusterStatusAggregator { store, node_id, leader, tracker }
    }

    /// Leader ID, or `None` if it cannot be determined right now.
    async fn leader_id(&self) -> Option<NodeId> {
        match self.leader.leader_id().await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "leader lookup failed");
                None
            }
        }
    }

    pub async fn self_role(&self) -> Role {
        Role::resolve(&self.node_id, self.leader_id().await.as_deref())
    }

    /// Fails with `NotLeader` unless this node currently leads.
    pub async fn require_leader(&self) -> Result<(), HubError> {
        let leader = self.leader.leader_id().await?;
        if leader.as_deref() != Some(self.node_id.as_str()) {
            return Err(HubError::NotLeader { leader });
        }
        Ok(())
    }

    /// Nodes with a live heartbeat, plus self. A node whose heartbeat went
    /// stale drops out even if its state maps are still stored.
    async fn node_ids(
        &self,
    ) -> Result<(BTreeMap<NodeId, HeartbeatRecord>, BTreeSet<NodeId>), HubError> {
        let live: BTreeMap<_, _> = known_nodes(self.store.as_ref())
            .await?
            .into_iter()
            .map(|r| (r.node_id.clone(), r))
            .collect();
        let mut ids: BTreeSet<NodeId> = live.keys().cloned().collect();
        ids.insert(self.node_id.clone());
        Ok((live, ids))
    }

    pub async fn snapshot(&self) -> Result<ClusterSnapshot, HubError> {
        let leader_id = self.leader_id().await;
        let (live, ids) = self.node_ids().await?;

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            let heartbeat = live.get(&id);
            let (projects, state_error) = match self.projects(&id).await {
                Ok(projects) => (projects, None),
                Err(e) => {
                    tracing::warn!(node = %id, error = %e, "node state unreadable");
                    (Vec::new(), Some(e.to_string()))
                }
            };
            nodes.push(NodeStatus {
                role: Role::resolve(&id, leader_id.as_deref()),
                alive: heartbeat.is_some() || id == self.node_id,
                address: heartbeat.map(|h| h.address.clone()),
                last_seen_ns: heartbeat.map(|h| h.last_seen_ns),
                executing: self.executing(&id).await,
                applied_version: self.applied_version(&id).await,
                projects,
                state_error,
                id,
            });
        }

        Ok(ClusterSnapshot {
            self_role: Role::resolve(&self.node_id, leader_id.as_deref()),
            self_id: self.node_id.clone(),
            leader_id,
            taken_at_ns: now_ns(),
            nodes,
        })
    }

    async fn projects(&self, node_id: &str) -> Result<Vec<ProjectStateView>, HubError> {
        let real = self.tracker.get_real_states(node_id).await?;
        let stamps = self.tracker.get_timestamps(node_id).await?;
        let expected = self.tracker.get_expected_states(node_id).await?;

        let ids: BTreeSet<&String> = real.keys().chain(expected.iter()).collect();
        Ok(ids
            .into_iter()
            .map(|id| ProjectStateView {
                id: id.clone(),
                status: real.get(id).copied(),
                status_changed_at_ns: stamps.get(id).copied(),
                expected_running: expected.contains(id),
            })
            .collect())
    }

    async fn executing(&self, node_id: &str) -> bool {
        match self.store.get(&execution_marker_key(node_id)).await {
            Ok(marker) => marker.is_some(),
            Err(e) => {
                tracing::warn!(node = node_id, error = %e, "execution marker unreadable");
                false
            }
        }
    }

    async fn applied_version(&self, node_id: &str) -> Option<String> {
        match self.store.get(&applied_version_key(node_id)).await {
            Ok(entry) => entry.map(|e| String::from_utf8_lossy(&e.value).into_owned()),
            Err(e) => {
                tracing::warn!(node = node_id, error = %e, "applied version unreadable");
                None
            }
        }
    }

    /// Execution state of every known node. Leader only.
    pub async fn follower_execution(&self) -> Result<FollowerExecutionStatus, HubError> {
        self.require_leader().await?;
        let (_, ids) = self.node_ids().await?;
        let markers: BTreeSet<String> = self
            .store
            .scan_keys(EXECUTION_MARKER_PREFIX)
            .await?
            .iter()
            .filter_map(|k| suffix(EXECUTION_MARKER_PREFIX, k).map(str::to_string))
            .collect();

        let mut node_status = BTreeMap::new();
        let mut executing_followers = 0;
        let mut idle_followers = 0;
        for id in ids {
            let role = Role::resolve(&id, Some(&self.node_id));
            let executing = markers.contains(&id);
            if role == Role::Follower {
                if executing {
                    executing_followers += 1;
                } else {
                    idle_followers += 1;
                }
            }
            node_status.insert(id, NodeExecution { executing, role });
        }
        Ok(FollowerExecutionStatus {
            total_nodes: node_status.len(),
            node_status,
            executing_followers,
            idle_followers,
            can_compact: markers.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::heartbeat::Heartbeat;
    use crate::keys::real_state_key;
    use hub_store::MemStore;
    use hub_types::{CasOutcome, KvEntry};

    /// Fails every mapping read for one node's real state.
    struct Flaky {
        inner: MemStore,
        broken: String,
    }

    impl CoordinationStore for Flaky {
        async fn set_if_absent(&self, k: &str, v: Vec<u8>, t: Option<Duration>) -> Result<bool, HubError> {
            self.inner.set_if_absent(k, v, t).await
        }
        async fn get(&self, k: &str) -> Result<Option<KvEntry>, HubError> {
            self.inner.get(k).await
        }
        async fn set(&self, k: &str, v: Vec<u8>, t: Option<Duration>) -> Result<u64, HubError> {
            self.inner.set(k, v, t).await
        }
        async fn compare_and_swap(&self, k: &str, e: Vec<u8>, n: Vec<u8>, t: Option<Duration>) -> Result<CasOutcome, HubError> {
            self.inner.compare_and_swap(k, e, n, t).await
        }
        async fn compare_and_delete(&self, k: &str, e: Vec<u8>) -> Result<bool, HubError> {
            self.inner.compare_and_delete(k, e).await
        }
        async fn delete(&self, k: &str) -> Result<bool, HubError> {
            self.inner.delete(k).await
        }
        async fn get_all_fields(&self, k: &str) -> Result<BTreeMap<String, String>, HubError> {
            if k == self.broken {
                return Err(HubError::StoreUnavailable("connection reset".into()));
            }
            self.inner.get_all_fields(k).await
        }
        async fn set_field(&self, k: &str, f: &str, v: String) -> Result<(), HubError> {
            self.inner.set_field(k, f, v).await
        }
        async fn delete_field(&self, k: &str, f: &str) -> Result<bool, HubError> {
            self.inner.delete_field(k, f).await
        }
        async fn scan_keys(&self, p: &str) -> Result<Vec<String>, HubError> {
            self.inner.scan_keys(p).await
        }
        async fn purge_expired(&self) -> Result<usize, HubError> {
            self.inner.purge_expired().await
        }
    }

    async fn register<S: CoordinationStore>(store: &Arc<S>, id: &str) {
        Heartbeat::new(
            store.clone(),
            id.to_string(),
            format!("http://{id}"),
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
        .beat()
        .await
        .unwrap();
    }

    fn aggregator<S: CoordinationStore>(store: &Arc<S>, id: &str, leader: &str) -> ClusterStatusAggregator<S> {
        ClusterStatusAggregator::new(
            store.clone(),
            id.to_string(),
            Arc::new(Leader::fixed(Some(leader.to_string()))),
            Arc::new(ProjectStateTracker::new(store.clone(), id.to_string())),
        )
    }

    #[tokio::test]
    async fn snapshot_joins_per_node_state() {
        let store = Arc::new(MemStore::new());
        register(&store, "n1").await;
        register(&store, "n2").await;
        ProjectStateTracker::new(store.clone(), "n2".to_string())
            .set_real_state("n2", "p1", ProjectStatus::Running)
            .await
            .unwrap();
        let agg = aggregator(&store, "n1", "n1");
        agg.tracker.set_expected_state("n2", "p1", true).await.unwrap();
        agg.tracker.set_expected_state("n2", "p2", true).await.unwrap();
        store.set(&execution_marker_key("n2"), b"1.1".to_vec(), None).await.unwrap();

        let snap = agg.snapshot().await.unwrap();
        assert_eq!(snap.self_role, Role::Leader);
        assert_eq!(snap.nodes.len(), 2);

        let n2 = snap.nodes.iter().find(|n| n.id == "n2").unwrap();
        assert_eq!(n2.role, Role::Follower);
        assert!(n2.alive && n2.executing);
        assert_eq!(n2.address.as_deref(), Some("http://n2"));
        assert_eq!(n2.projects.len(), 2);
        assert_eq!(n2.projects[0].status, Some(ProjectStatus::Running));
        assert!(n2.projects[0].status_changed_at_ns.is_some());
        assert_eq!(n2.projects[1].status, None);
        assert!(n2.projects[1].expected_running);
    }

    #[tokio::test]
    async fn unreadable_node_gets_empty_states() {
        let store = Arc::new(Flaky { inner: MemStore::new(), broken: real_state_key("n2") });
        register(&store, "n1").await;
        register(&store, "n2").await;
        ProjectStateTracker::new(store.clone(), "n1".to_string())
            .set_real_state("n1", "p1", ProjectStatus::Running)
            .await
            .unwrap();

        let snap = aggregator(&store, "n1", "n1").snapshot().await.unwrap();
        let n1 = snap.nodes.iter().find(|n| n.id == "n1").unwrap();
        let n2 = snap.nodes.iter().find(|n| n.id == "n2").unwrap();
        assert_eq!(n1.projects.len(), 1);
        assert!(n2.projects.is_empty());
        assert!(n2.state_error.is_some());
    }

    #[tokio::test]
    async fn stale_node_is_not_listed() {
        let store = Arc::new(MemStore::new());
        register(&store, "n2").await;
        ProjectStateTracker::new(store.clone(), "gone".to_string())
            .set_real_state("gone", "p1", ProjectStatus::Error)
            .await
            .unwrap();
        Heartbeat::new(
            store.clone(),
            "gone".to_string(),
            "http://gone".to_string(),
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .beat()
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let agg = aggregator(&store, "n1", "n1");
        let snap = agg.snapshot().await.unwrap();
        let ids: Vec<_> = snap.nodes.iter().map(|n| n.id.as_str()).collect();
        // Self is listed even before its first heartbeat.
        assert_eq!(ids, vec!["n1", "n2"]);
        assert!(snap.nodes.iter().all(|n| n.alive));

        let execution = agg.follower_execution().await.unwrap();
        assert!(!execution.node_status.contains_key("gone"));
    }

    #[tokio::test]
    async fn follower_execution_is_leader_only() {
        let store = Arc::new(MemStore::new());
        register(&store, "n1").await;
        register(&store, "n2").await;
        register(&store, "n3").await;
        store.set(&execution_marker_key("n3"), b"1.4".to_vec(), None).await.unwrap();

        let err = aggregator(&store, "n2", "n1").follower_execution().await.unwrap_err();
        assert_eq!(err.kind(), "not_leader");

        let status = aggregator(&store, "n1", "n1").follower_execution().await.unwrap();
        assert_eq!(status.total_nodes, 3);
        assert_eq!(status.executing_followers, 1);
        assert_eq!(status.idle_followers, 1);
        assert!(!status.can_compact);
        assert_eq!(status.node_status["n1"].role, Role::Leader);
    }
}
