use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use hub_store::{CoordinationStore, TtlSweeper};
use hub_types::{HubError, NodeId, Role};

use crate::component_update::ComponentUpdateManager;
use crate::engine::LocalEngine;
use crate::heartbeat::{reap_departed, Heartbeat};
use crate::instruction::InstructionManager;
use crate::leader::{Leader, LeaderSource};
use crate::lifecycle::ProjectController;
use crate::operation::OperationArchive;
use crate::project_state::ProjectStateTracker;
use crate::settings::ClusterSettings;
use crate::status::ClusterStatusAggregator;

/// Everything one node needs to take part in the cluster, wired once at
/// startup and torn down with [`shutdown`](Self::shutdown).
pub struct ClusterContext<S, E> {
    node_id: NodeId,
    settings: ClusterSettings,
    store: Arc<S>,
    leader: Arc<Leader<S>>,
    tracker: Arc<ProjectStateTracker<S>>,
    heartbeat: Arc<Heartbeat<S>>,
    instructions: Arc<InstructionManager<S, E>>,
    updates: Arc<ComponentUpdateManager<S, E>>,
    projects: ProjectController<S, E>,
    status: ClusterStatusAggregator<S>,
}

impl<S: CoordinationStore, E: LocalEngine> ClusterContext<S, E> {
    pub fn new(
        store: Arc<S>,
        engine: Arc<E>,
        node_id: NodeId,
        address: String,
        leader: Leader<S>,
        settings: ClusterSettings,
    ) -> Result<Self, HubError> {
        settings.validate()?;
        if node_id.is_empty() {
            return Err(HubError::InvalidArgument("node id must not be empty".into()));
        }

        let leader = Arc::new(leader);
        let tracker = Arc::new(ProjectStateTracker::new(store.clone(), node_id.clone()));
        let heartbeat = Arc::new(Heartbeat::new(
            store.clone(),
            node_id.clone(),
            address,
            settings.heartbeat_interval(),
            settings.node_timeout(),
        ));
        let instructions = Arc::new(InstructionManager::new(
            store.clone(),
            engine,
            tracker.clone(),
            node_id.clone(),
            &settings,
        ));
        let updates = Arc::new(ComponentUpdateManager::new(
            store.clone(),
            node_id.clone(),
            instructions.clone(),
            tracker.clone(),
            leader.clone(),
            Arc::new(OperationArchive::new(settings.operation_history)),
            &settings,
        ));
        let status =
            ClusterStatusAggregator::new(store.clone(), node_id.clone(), leader.clone(), tracker.clone());

        Ok(ClusterContext {
            projects: ProjectController::new(updates.clone()),
            node_id,
            settings,
            store,
            leader,
            tracker,
            heartbeat,
            instructions,
            updates,
            status,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tracker(&self) -> &ProjectStateTracker<S> {
        &self.tracker
    }

    pub fn instructions(&self) -> &InstructionManager<S, E> {
        &self.instructions
    }

    pub fn updates(&self) -> &ComponentUpdateManager<S, E> {
        &self.updates
    }

    pub fn projects(&self) -> &ProjectController<S, E> {
        &self.projects
    }

    pub fn status(&self) -> &ClusterStatusAggregator<S> {
        &self.status
    }

    pub async fn role(&self) -> Role {
        self.status.self_role().await
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == Role::Leader
    }

    /// Restore local cursors from the store, replay the current instruction
    /// on the engine and announce this node.
    pub async fn start(&self) -> Result<(), HubError> {
        let applied = self.instructions.resume().await?;
        let manifest_version = self.updates.reload_manifest().await?;
        self.heartbeat.beat().await?;
        tracing::info!(
            node = %self.node_id,
            %applied,
            manifest_version = ?manifest_version.map(|v| v.to_string()),
            "cluster context started"
        );
        Ok(())
    }

    /// Leader only: drop the stored state of nodes whose heartbeat expired.
    /// Followers return an empty list.
    pub async fn reap_departed(&self) -> Result<Vec<NodeId>, HubError> {
        reap_if_leader(&self.store, &self.tracker, &self.leader, &self.node_id).await
    }

    /// Spawn heartbeat, instruction polling, departed-node reaping and TTL
    /// sweeping. All tasks exit once `shutdown` flips to `true`.
    pub fn spawn_background(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let heartbeat = self.heartbeat.clone();
        let hb_rx = shutdown.clone();
        let instructions = self.instructions.clone();
        let poll_rx = shutdown.clone();
        let poll_interval = self.settings.instruction_poll_interval();
        let reaper = reap_loop(
            self.store.clone(),
            self.tracker.clone(),
            self.leader.clone(),
            self.node_id.clone(),
            self.settings.node_timeout(),
            shutdown.clone(),
        );
        let sweeper = TtlSweeper::new(self.store.clone(), self.settings.ttl_sweep_interval());

        vec![
            tokio::spawn(async move { heartbeat.run(hb_rx).await }),
            tokio::spawn(async move { instructions.run_follower(poll_interval, poll_rx).await }),
            tokio::spawn(reaper),
            tokio::spawn(sweeper.run(shutdown)),
        ]
    }

    /// Withdraw this node: its heartbeat and any execution marker are removed
    /// so it stops counting as alive or as blocking compaction.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let heartbeat = self.heartbeat.clear().await;
        let marker = self.instructions.clear_marker().await;
        tracing::info!(node = %self.node_id, "cluster context shut down");
        heartbeat.and(marker)
    }
}

async fn reap_if_leader<S: CoordinationStore>(
    store: &Arc<S>,
    tracker: &ProjectStateTracker<S>,
    leader: &Leader<S>,
    node_id: &str,
) -> Result<Vec<NodeId>, HubError> {
    if leader.leader_id().await?.as_deref() != Some(node_id) {
        return Ok(Vec::new());
    }
    reap_departed(store.as_ref(), tracker, node_id).await
}

async fn reap_loop<S: CoordinationStore>(
    store: Arc<S>,
    tracker: Arc<ProjectStateTracker<S>>,
    leader: Arc<Leader<S>>,
    node_id: NodeId,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
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
        if let Err(e) = reap_if_leader(&store, &tracker, &leader, &node_id).await {
            tracing::warn!(node = %node_id, error = %e, "departed node reaping failed");
        }
    }
    tracing::debug!(node = %node_id, "reaper stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::InMemoryEngine;
    use crate::heartbeat::known_nodes;
    use crate::manifest::{ComponentChange, ComponentKey, ComponentKind};
    use hub_store::MemStore;
    use hub_types::ProjectStatus;

    fn fast_settings() -> ClusterSettings {
        ClusterSettings {
            heartbeat_interval_ms: 20,
            instruction_poll_interval_ms: 20,
            ttl_sweep_interval_ms: 20,
            ..ClusterSettings::default()
        }
    }

    fn context(store: &Arc<MemStore>, id: &str) -> ClusterContext<MemStore, InMemoryEngine> {
        ClusterContext::new(
            store.clone(),
            Arc::new(InMemoryEngine::new()),
            id.to_string(),
            format!("http://{id}"),
            Leader::from_store(store.clone()),
            fast_settings(),
        )
        .unwrap()
    }

    #[test]
    fn invalid_settings_are_refused() {
        let store = Arc::new(MemStore::new());
        let settings = ClusterSettings { epoch: 0, ..ClusterSettings::default() };
        let res = ClusterContext::new(
            store.clone(),
            Arc::new(InMemoryEngine::new()),
            "n1".into(),
            "http://n1".into(),
            Leader::from_store(store),
            settings,
        );
        assert!(res.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn follower_converges_in_background() {
        let store = Arc::new(MemStore::new());
        store.set(crate::keys::LEADER_KEY, b"leader".to_vec(), None).await.unwrap();
        let leader = context(&store, "leader");
        let follower = context(&store, "f1");
        leader.start().await.unwrap();
        follower.start().await.unwrap();
        assert!(leader.is_leader().await);
        assert!(!follower.is_leader().await);

        let (tx, rx) = watch::channel(false);
        let mut tasks = follower.spawn_background(rx.clone());
        tasks.extend(leader.spawn_background(rx));

        let updates = leader.updates();
        updates
            .update_component(ComponentChange::add(ComponentKey::new(ComponentKind::Input, "i1"), "x"))
            .await
            .unwrap();
        updates
            .update_component(ComponentChange::add(
                ComponentKey::new(ComponentKind::Project, "p1"),
                "input:i1",
            ))
            .await
            .unwrap();
        let receipt = leader.projects().start("p1").await.unwrap();

        let mut converged = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let real = follower.tracker().get_real_states("f1").await.unwrap();
            if real.get("p1") == Some(&ProjectStatus::Running) {
                converged = true;
                break;
            }
        }
        assert!(converged, "follower did not converge");
        assert_eq!(follower.instructions().last_applied().await, receipt.version);

        tx.send(true).unwrap();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        }
        follower.shutdown().await.unwrap();
        let nodes = known_nodes(store.as_ref()).await.unwrap();
        assert_eq!(nodes.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(), vec!["leader"]);
    }

    #[tokio::test]
    async fn only_the_leader_reaps_departed_nodes() {
        let store = Arc::new(MemStore::new());
        store.set(crate::keys::LEADER_KEY, b"leader".to_vec(), None).await.unwrap();
        let leader = context(&store, "leader");
        let follower = context(&store, "f1");
        leader.start().await.unwrap();
        follower.start().await.unwrap();
        ProjectStateTracker::new(store.clone(), "gone".to_string())
            .set_real_state("gone", "p1", ProjectStatus::Running)
            .await
            .unwrap();

        assert!(follower.reap_departed().await.unwrap().is_empty());
        assert_eq!(leader.reap_departed().await.unwrap(), vec!["gone".to_string()]);
        assert!(leader.tracker().get_real_states("gone").await.unwrap().is_empty());
        let snapshot = leader.status().snapshot().await.unwrap();
        let ids: Vec<_> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "leader"]);
    }

    #[tokio::test]
    async fn restarted_node_runs_its_projects_again() {
        let store = Arc::new(MemStore::new());
        store.set(crate::keys::LEADER_KEY, b"leader".to_vec(), None).await.unwrap();
        let leader = context(&store, "leader");
        leader.start().await.unwrap();
        let updates = leader.updates();
        updates
            .update_component(ComponentChange::add(ComponentKey::new(ComponentKind::Input, "i1"), "x"))
            .await
            .unwrap();
        updates
            .update_component(ComponentChange::add(
                ComponentKey::new(ComponentKind::Project, "p1"),
                "input:i1",
            ))
            .await
            .unwrap();
        leader.projects().start("p1").await.unwrap();

        let follower = context(&store, "f1");
        follower.start().await.unwrap();
        follower.instructions().sync().await.unwrap();
        follower.shutdown().await.unwrap();

        let engine = Arc::new(InMemoryEngine::new());
        let again = ClusterContext::new(
            store.clone(),
            engine.clone(),
            "f1".to_string(),
            "http://f1".to_string(),
            Leader::from_store(store.clone()),
            fast_settings(),
        )
        .unwrap();
        again.start().await.unwrap();
        assert_eq!(engine.running_projects().await, vec!["p1".to_string()]);
        assert_eq!(
            again.tracker().get_real_states("f1").await.unwrap()["p1"],
            ProjectStatus::Running
        );
    }

    #[tokio::test]
    async fn restart_resumes_from_store() {
        let store = Arc::new(MemStore::new());
        store.set(crate::keys::LEADER_KEY, b"leader".to_vec(), None).await.unwrap();
        let leader = context(&store, "leader");
        leader.start().await.unwrap();
        leader
            .updates()
            .update_component(ComponentChange::add(ComponentKey::new(ComponentKind::Input, "i1"), "x"))
            .await
            .unwrap();

        let again = context(&store, "leader");
        again.start().await.unwrap();
        assert_eq!(again.instructions().last_applied().await.to_string(), "1.1");
        assert!(again
            .updates()
            .manifest()
            .await
            .components
            .contains_key(&ComponentKey::new(ComponentKind::Input, "i1")));
    }
}
