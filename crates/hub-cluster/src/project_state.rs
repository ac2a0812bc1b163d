use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hub_store::CoordinationStore;
use hub_types::{now_ns, HubError, NodeId, ProjectId, ProjectStatus};

use crate::keys::{expected_state_key, real_state_key, state_timestamp_key};

const EXPECTED_RUNNING: &str = "running";

/// Reads and writes per-node project state mappings.
///
/// Real state is self-reported: a node only ever writes its own. Expected
/// state can be written for any node by the leader.
pub struct ProjectStateTracker<S> {
    store: Arc<S>,
    local_node: NodeId,
}

impl<S: CoordinationStore> ProjectStateTracker<S> {
    pub fn new(store: Arc<S>, local_node: NodeId) -> Self {
        ProjectStateTracker { store, local_node }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Record this node's status for `project`. The change timestamp only
    /// moves when the status actually changes, so it marks when the project
    /// entered its current status.
    pub async fn set_real_state(
        &self,
        node_id: &str,
        project_id: &str,
        status: ProjectStatus,
    ) -> Result<(), HubError> {
        if node_id != self.local_node {
            return Err(HubError::InvalidArgument(format!(
                "node '{}' cannot report real state for '{node_id}'",
                self.local_node
            )));
        }
        let real_key = real_state_key(node_id);
        let ts_key = state_timestamp_key(node_id);

        let previous = self.store.get_all_fields(&real_key).await?.remove(project_id);
        let changed = previous.as_deref() != Some(status.as_str());
        let stamped = self.get_timestamp(node_id, project_id).await?.is_some();

        self.store.set_field(&real_key, project_id, status.as_str().to_string()).await?;
        if changed || !stamped {
            self.store.set_field(&ts_key, project_id, now_ns().to_string()).await?;
            tracing::debug!(node = node_id, project = project_id, %status, "real state changed");
        }
        Ok(())
    }

    /// Unparsable entries are skipped with a warning.
    pub async fn get_real_states(
        &self,
        node_id: &str,
    ) -> Result<BTreeMap<ProjectId, ProjectStatus>, HubError> {
        let raw = self.store.get_all_fields(&real_state_key(node_id)).await?;
        let mut out = BTreeMap::new();
        for (project, value) in raw {
            match value.parse::<ProjectStatus>() {
                Ok(status) => {
                    out.insert(project, status);
                }
                Err(_) => {
                    tracing::warn!(node = node_id, project = %project, value = %value, "unknown project status")
                }
            }
        }
        Ok(out)
    }

    pub async fn get_timestamp(
        &self,
        node_id: &str,
        project_id: &str,
    ) -> Result<Option<i64>, HubError> {
        Ok(self.get_timestamps(node_id).await?.remove(project_id))
    }

    pub async fn get_timestamps(&self, node_id: &str) -> Result<BTreeMap<ProjectId, i64>, HubError> {
        let raw = self.store.get_all_fields(&state_timestamp_key(node_id)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(project, ts)| ts.parse::<i64>().ok().map(|ts| (project, ts)))
            .collect())
    }

    /// Drop a project's real state and timestamp from this node's mappings.
    pub async fn remove_project(&self, project_id: &str) -> Result<(), HubError> {
        self.store.delete_field(&real_state_key(&self.local_node), project_id).await?;
        self.store.delete_field(&state_timestamp_key(&self.local_node), project_id).await?;
        Ok(())
    }

    /// Delete every mapping held for `node_id`. Used once a node has left
    /// the cluster.
    pub async fn forget_node(&self, node_id: &str) -> Result<(), HubError> {
        self.store.delete(&real_state_key(node_id)).await?;
        self.store.delete(&state_timestamp_key(node_id)).await?;
        self.store.delete(&expected_state_key(node_id)).await?;
        Ok(())
    }

    /// `running == false` removes the entry: absence means "stopped".
    pub async fn set_expected_state(
        &self,
        node_id: &str,
        project_id: &str,
        running: bool,
    ) -> Result<(), HubError> {
        let key = expected_state_key(node_id);
        if running {
            self.store.set_field(&key, project_id, EXPECTED_RUNNING.to_string()).await
        } else {
            self.store.delete_field(&key, project_id).await.map(|_| ())
        }
    }

    /// Projects expected to run on `node_id`.
    pub async fn get_expected_states(&self, node_id: &str) -> Result<BTreeSet<ProjectId>, HubError> {
        let raw = self.store.get_all_fields(&expected_state_key(node_id)).await?;
        Ok(raw
            .into_iter()
            .filter(|(_, v)| v == EXPECTED_RUNNING)
            .map(|(k, _)| k)
            .collect())
    }
}
