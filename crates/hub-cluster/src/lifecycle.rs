use std::sync::Arc;

use hub_store::CoordinationStore;
use hub_types::{HubError, ProjectId};

use crate::component_update::{ComponentUpdateManager, UpdateReceipt};
use crate::engine::LocalEngine;
use crate::manifest::{ClusterManifest, ComponentKey, ComponentKind};
use crate::operation::OperationType;

/// Starts, stops and restarts projects cluster-wide.
///
/// Runs through the same guarded flow as component updates, locked on the
/// project's component key so a definition change and a lifecycle request
/// for one project never overlap.
pub struct ProjectController<S, E> {
    updates: Arc<ComponentUpdateManager<S, E>>,
}

impl<S: CoordinationStore, E: LocalEngine> ProjectController<S, E> {
    pub fn new(updates: Arc<ComponentUpdateManager<S, E>>) -> Self {
        ProjectController { updates }
    }

    pub async fn start(&self, project_id: &str) -> Result<UpdateReceipt, HubError> {
        let id = project_id.to_string();
        self.run(OperationType::ProjectStart, project_id, move |m| {
            m.set_desired(&id, true)?;
            Ok(vec![id])
        })
        .await
    }

    pub async fn stop(&self, project_id: &str) -> Result<UpdateReceipt, HubError> {
        let id = project_id.to_string();
        self.run(OperationType::ProjectStop, project_id, move |m| {
            m.set_desired(&id, false)?;
            Ok(vec![id])
        })
        .await
    }

    /// Bumps the project's generation so every engine restarts it.
    pub async fn restart(&self, project_id: &str) -> Result<UpdateReceipt, HubError> {
        let id = project_id.to_string();
        self.run(OperationType::ProjectRestart, project_id, move |m| {
            let generation = m.restart(&id)?;
            tracing::debug!(project = %id, generation, "restart requested");
            Ok(vec![id])
        })
        .await
    }

    async fn run<F>(
        &self,
        operation: OperationType,
        project_id: &str,
        mutate: F,
    ) -> Result<UpdateReceipt, HubError>
    where
        F: FnOnce(&mut ClusterManifest) -> Result<Vec<ProjectId>, HubError> + Send,
    {
        if project_id.is_empty() {
            return Err(HubError::InvalidArgument("project id must not be empty".into()));
        }
        let lock = ComponentKey::new(ComponentKind::Project, project_id).to_string();
        self.updates
            .run_guarded(operation, project_id.to_string(), lock, mutate)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::InMemoryEngine;
    use crate::heartbeat::Heartbeat;
    use crate::instruction::InstructionManager;
    use crate::leader::Leader;
    use crate::manifest::ComponentChange;
    use crate::operation::OperationArchive;
    use crate::project_state::ProjectStateTracker;
    use crate::settings::ClusterSettings;
    use hub_store::MemStore;
    use hub_types::ProjectStatus;

    struct Node {
        tracker: Arc<ProjectStateTracker<MemStore>>,
        instructions: Arc<InstructionManager<MemStore, InMemoryEngine>>,
        engine: InMemoryEngine,
        updates: Arc<ComponentUpdateManager<MemStore, InMemoryEngine>>,
    }

    async fn node(store: &Arc<MemStore>, id: &str) -> Node {
        let settings = ClusterSettings::default();
        let engine = InMemoryEngine::new();
        let tracker = Arc::new(ProjectStateTracker::new(store.clone(), id.to_string()));
        let instructions = Arc::new(InstructionManager::new(
            store.clone(),
            Arc::new(engine.clone()),
            tracker.clone(),
            id.to_string(),
            &settings,
        ));
        let updates = Arc::new(ComponentUpdateManager::new(
            store.clone(),
            id.to_string(),
            instructions.clone(),
            tracker.clone(),
            Arc::new(Leader::fixed(Some("leader".into()))),
            Arc::new(OperationArchive::new(16)),
            &settings,
        ));
        Heartbeat::new(
            store.clone(),
            id.to_string(),
            id.to_string(),
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
        .beat()
        .await
        .unwrap();
        Node { tracker, instructions, engine, updates }
    }

    async fn define_project(leader: &Node, project: &str) {
        leader
            .updates
            .update_component(ComponentChange::add(
                ComponentKey::new(ComponentKind::Input, format!("{project}-in")),
                "src",
            ))
            .await
            .unwrap();
        leader
            .updates
            .update_component(ComponentChange::add(
                ComponentKey::new(ComponentKind::Project, project),
                format!("input:{project}-in"),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_converges_expected_and_real_state() {
        let store = Arc::new(MemStore::new());
        let leader = node(&store, "leader").await;
        let follower = node(&store, "f1").await;
        define_project(&leader, "p1").await;

        let controller = ProjectController::new(leader.updates.clone());
        controller.start("p1").await.unwrap();

        // Expected state is set for every known node, including the leader.
        for id in ["leader", "f1"] {
            let expected = leader.tracker.get_expected_states(id).await.unwrap();
            assert!(expected.contains("p1"), "{id} should expect p1 running");
        }

        // Bounded polls bring the follower's real state in line.
        let mut converged = false;
        for _ in 0..5 {
            follower.instructions.poll_once().await.unwrap();
            let real = follower.tracker.get_real_states("f1").await.unwrap();
            if real.get("p1") == Some(&ProjectStatus::Running) {
                converged = true;
                break;
            }
        }
        assert!(converged);
        assert_eq!(
            leader.tracker.get_real_states("leader").await.unwrap()["p1"],
            ProjectStatus::Running
        );
    }

    #[tokio::test]
    async fn stop_clears_expected_state() {
        let store = Arc::new(MemStore::new());
        let leader = node(&store, "leader").await;
        let follower = node(&store, "f1").await;
        define_project(&leader, "p1").await;

        let controller = ProjectController::new(leader.updates.clone());
        controller.start("p1").await.unwrap();
        let receipt = controller.stop("p1").await.unwrap();

        assert!(leader.tracker.get_expected_states("f1").await.unwrap().is_empty());
        assert_eq!(follower.instructions.sync().await.unwrap(), receipt.version);
        assert_eq!(
            follower.tracker.get_real_states("f1").await.unwrap()["p1"],
            ProjectStatus::Stopped
        );
    }

    #[tokio::test]
    async fn restart_restarts_running_engines() {
        let store = Arc::new(MemStore::new());
        let leader = node(&store, "leader").await;
        let follower = node(&store, "f1").await;
        define_project(&leader, "p1").await;

        let controller = ProjectController::new(leader.updates.clone());
        controller.start("p1").await.unwrap();
        follower.instructions.sync().await.unwrap();

        controller.restart("p1").await.unwrap();
        follower.instructions.sync().await.unwrap();
        assert_eq!(follower.engine.restart_count().await, 1);
        assert_eq!(leader.engine.restart_count().await, 1);
    }

    #[tokio::test]
    async fn unknown_project_is_rejected() {
        let store = Arc::new(MemStore::new());
        let leader = node(&store, "leader").await;
        let controller = ProjectController::new(leader.updates.clone());

        let err = controller.start("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert!(controller.start("").await.is_err());

        let record = &leader.updates.archive().recent(1).await[0];
        assert_eq!(record.operation, OperationType::ProjectStart);
    }
}
