use std::collections::VecDeque;
use std::fmt;

use tokio::sync::RwLock;

use hub_types::{HubError, ProjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ComponentAdd,
    ComponentUpdate,
    ComponentDelete,
    ProjectStart,
    ProjectStop,
    ProjectRestart,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::ComponentAdd => "component_add",
            OperationType::ComponentUpdate => "component_update",
            OperationType::ComponentDelete => "component_delete",
            OperationType::ProjectStart => "project_start",
            OperationType::ProjectStop => "project_stop",
            OperationType::ProjectRestart => "project_restart",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationOutcome {
    Success,
    Failed,
    /// Refused before any state changed (busy lock, not leader, bad input).
    Rejected,
}

/// Archived result of one leader-side operation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub operation: OperationType,
    /// Component key or project ID the operation targeted.
    pub subject: String,
    pub outcome: OperationOutcome,
    pub started_at_ns: i64,
    pub finished_at_ns: i64,
    pub affected_projects: Vec<ProjectId>,
    /// Published instruction version, `epoch.sequence`.
    pub version: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
}

impl OperationRecord {
    pub fn outcome_of(result: &Result<(), HubError>) -> OperationOutcome {
        match result {
            Ok(()) => OperationOutcome::Success,
            Err(HubError::LockBusy { .. })
            | Err(HubError::NotLeader { .. })
            | Err(HubError::InvalidArgument(_)) => OperationOutcome::Rejected,
            Err(_) => OperationOutcome::Failed,
        }
    }
}

/// Bounded, newest-last history of finished operations.
pub struct OperationArchive {
    records: RwLock<VecDeque<OperationRecord>>,
    capacity: usize,
}

impl OperationArchive {
    pub fn new(capacity: usize) -> Self {
        OperationArchive { records: RwLock::new(VecDeque::new()), capacity: capacity.max(1) }
    }

    pub async fn push(&self, record: OperationRecord) {
        let mut g = self.records.write().await;
        if g.len() == self.capacity {
            g.pop_front();
        }
        g.push_back(record);
    }

    /// Up to `limit` most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<OperationRecord> {
        self.records.read().await.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}
