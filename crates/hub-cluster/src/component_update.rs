use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockWriteGuard};

use hub_store::CoordinationStore;
use hub_types::{now_ns, HubError, InstructionVersion, NodeId, ProjectId};

use crate::engine::LocalEngine;
use crate::heartbeat::known_nodes;
use crate::instruction::InstructionManager;
use crate::leader::{Leader, LeaderSource};
use crate::lock::{DistributedLock, LockLease};
use crate::manifest::{ChangeKind, ClusterManifest, ComponentChange};
use crate::operation::{OperationArchive, OperationRecord, OperationType};
use crate::project_state::ProjectStateTracker;
use crate::settings::ClusterSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Idle,
    Preparing,
    Updating,
    Completing,
    Failed,
}

/// One in-flight guarded operation as shown on the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ComponentUpdateOperation {
    pub id: String,
    pub operation: OperationType,
    pub subject: String,
    pub lock_name: String,
    pub state: UpdateState,
    pub affected_projects: Vec<ProjectId>,
    pub started_at_ns: i64,
    pub last_update_ns: i64,
    pub lock_holder: Option<NodeId>,
    pub published_version: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReceipt {
    pub operation_id: String,
    pub version: InstructionVersion,
    pub affected_projects: Vec<ProjectId>,
}

struct ManifestState {
    manifest: ClusterManifest,
    version: Option<InstructionVersion>,
}

/// Leader-side driver for configuration changes.
///
/// Every change runs `Idle -> Preparing -> Updating -> Completing` under a
/// distributed lock named after the changed resource. Failures end in
/// `Failed` with the lock released; nothing is rolled back.
///
/// The update timeout bounds everything before the publish. Once an
/// instruction is out the operation reports success; the leader's own
/// engine then applies it like any follower, and polling retries a failed
/// local apply.
pub struct ComponentUpdateManager<S, E> {
    store: Arc<S>,
    node_id: NodeId,
    locks: DistributedLock<S>,
    instructions: Arc<InstructionManager<S, E>>,
    tracker: Arc<ProjectStateTracker<S>>,
    leader: Arc<Leader<S>>,
    manifest: RwLock<ManifestState>,
    active: RwLock<HashMap<String, ComponentUpdateOperation>>,
    archive: Arc<OperationArchive>,
    lock_ttl: Duration,
    refresh_interval: Duration,
    update_timeout: Duration,
}

impl<S: CoordinationStore, E: LocalEngine> ComponentUpdateManager<S, E> {
    pub fn new(
        store: Arc<S>,
        node_id: NodeId,
        instructions: Arc<InstructionManager<S, E>>,
        tracker: Arc<ProjectStateTracker<S>>,
        leader: Arc<Leader<S>>,
        archive: Arc<OperationArchive>,
        settings: &ClusterSettings,
    ) -> Self {
        ComponentUpdateManager {
            locks: DistributedLock::new(store.clone()),
            store,
            node_id,
            instructions,
            tracker,
            leader,
            manifest: RwLock::new(ManifestState { manifest: ClusterManifest::default(), version: None }),
            active: RwLock::new(HashMap::new()),
            archive,
            lock_ttl: settings.lock_ttl(),
            refresh_interval: settings.lock_refresh_interval(),
            update_timeout: settings.update_timeout(),
        }
    }

    pub fn locks(&self) -> &DistributedLock<S> {
        &self.locks
    }

    pub fn archive(&self) -> &Arc<OperationArchive> {
        &self.archive
    }

    /// Add, update or delete one component cluster-wide.
    pub async fn update_component(&self, change: ComponentChange) -> Result<UpdateReceipt, HubError> {
        let operation = match change.kind {
            ChangeKind::Add => OperationType::ComponentAdd,
            ChangeKind::Update => OperationType::ComponentUpdate,
            ChangeKind::Delete => OperationType::ComponentDelete,
        };
        let name = change.component.to_string();
        self.run_guarded(operation, name.clone(), name, move |m| m.apply_change(&change))
            .await
    }

    /// Current desired manifest as last published or loaded by this node.
    pub async fn manifest(&self) -> ClusterManifest {
        self.manifest.read().await.manifest.clone()
    }

    /// Pick up the latest published manifest, e.g. after a leader change.
    pub async fn reload_manifest(&self) -> Result<Option<InstructionVersion>, HubError> {
        let mut state = self.manifest.write().await;
        self.refresh_manifest(&mut state).await?;
        Ok(state.version)
    }

    async fn refresh_manifest(&self, state: &mut ManifestState) -> Result<(), HubError> {
        let Some(current) = self.instructions.current_version().await? else {
            return Ok(());
        };
        if state.version.is_some_and(|v| v >= current) {
            return Ok(());
        }
        match self.instructions.instruction(current).await? {
            Some(instruction) => {
                tracing::debug!(version = %current, "manifest reloaded from store");
                state.manifest = instruction.manifest;
                state.version = Some(current);
                Ok(())
            }
            None => Err(HubError::StoreUnavailable(format!("instruction {current} not readable"))),
        }
    }

    /// In-flight operations, oldest first.
    pub async fn active_operations(&self) -> Vec<ComponentUpdateOperation> {
        let mut ops: Vec<_> = self.active.read().await.values().cloned().collect();
        ops.sort_by_key(|op| op.started_at_ns);
        ops
    }

    /// Run `mutate` against the manifest under the `lock_name` lock, publish
    /// the result and apply it locally.
    pub(crate) async fn run_guarded<F>(
        &self,
        operation: OperationType,
        subject: String,
        lock_name: String,
        mutate: F,
    ) -> Result<UpdateReceipt, HubError>
    where
        F: FnOnce(&mut ClusterManifest) -> Result<Vec<ProjectId>, HubError> + Send,
    {
        let op = ComponentUpdateOperation {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            subject,
            lock_name: lock_name.clone(),
            state: UpdateState::Idle,
            affected_projects: Vec::new(),
            started_at_ns: now_ns(),
            last_update_ns: now_ns(),
            lock_holder: None,
            published_version: None,
            error: None,
        };

        if let Err(e) = self.check_leader().await {
            self.finish(op, Err(e.clone())).await;
            return Err(e);
        }

        {
            let mut active = self.active.write().await;
            if active.contains_key(&lock_name) {
                drop(active);
                let e = HubError::LockBusy { resource: lock_name, holder: Some(self.node_id.clone()) };
                self.finish(op, Err(e.clone())).await;
                return Err(e);
            }
            let mut preparing = op.clone();
            preparing.state = UpdateState::Preparing;
            active.insert(lock_name.clone(), preparing);
        }

        let lease = match self.locks.try_acquire(&lock_name, &self.node_id, self.lock_ttl).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::info!(lock = %lock_name, error = %e, "update rejected");
                let op = self.take_active(&lock_name).await.unwrap_or(op);
                self.finish(op, Err(e.clone())).await;
                return Err(e);
            }
        };

        self.transition(&lock_name, |op| {
            op.state = UpdateState::Updating;
            op.lock_holder = Some(lease.owner.clone());
        })
        .await;

        let lost = Arc::new(AtomicBool::new(false));
        let refresher = tokio::spawn(keep_lease(
            self.locks.clone(),
            lease.clone(),
            self.refresh_interval,
            lost.clone(),
        ));

        let result = self.execute(&lock_name, operation, mutate, &lost).await;

        refresher.abort();
        self.release(lease).await;

        let op = self.take_active(&lock_name).await.unwrap_or(op);
        match result {
            Ok((version, affected)) => {
                let receipt = UpdateReceipt {
                    operation_id: op.id.clone(),
                    version,
                    affected_projects: affected,
                };
                self.finish(op, Ok(())).await;
                Ok(receipt)
            }
            Err(e) => {
                self.finish(op, Err(e.clone())).await;
                Err(e)
            }
        }
    }

    async fn execute<F>(
        &self,
        lock_name: &str,
        operation: OperationType,
        mutate: F,
        lost: &AtomicBool,
    ) -> Result<(InstructionVersion, Vec<ProjectId>), HubError>
    where
        F: FnOnce(&mut ClusterManifest) -> Result<Vec<ProjectId>, HubError> + Send,
    {
        let (mut state, next, affected) =
            match tokio::time::timeout(self.update_timeout, self.prepare(lock_name, mutate)).await {
                Ok(prepared) => prepared?,
                Err(_) => {
                    tracing::warn!(lock = %lock_name, timeout_secs = self.update_timeout.as_secs(), "update timed out");
                    return Err(HubError::Timeout);
                }
            };
        if lost.load(Ordering::SeqCst) {
            return Err(HubError::StaleLock {
                resource: lock_name.to_string(),
                owner: self.node_id.clone(),
            });
        }

        let subject = self
            .active
            .read()
            .await
            .get(lock_name)
            .map(|op| op.subject.clone())
            .unwrap_or_else(|| lock_name.to_string());
        let instruction = self.instructions.publish_instruction(operation, &subject, next.clone()).await?;
        let version = instruction.version;
        state.manifest = next;
        state.version = Some(version);
        let manifest = state.manifest.clone();
        drop(state);

        self.transition(lock_name, |op| {
            op.state = UpdateState::Completing;
            op.published_version = Some(version.to_string());
        })
        .await;
        if let Err(e) = self.instructions.apply_instruction(&instruction).await {
            tracing::warn!(%version, error = %e, "local apply after publish failed; polling will retry");
        }
        self.sync_expected_states(&manifest, &affected).await;
        Ok((version, affected))
    }

    /// Everything before the point of no return: load the latest manifest
    /// and compute the change. The manifest stays locked for the publish.
    async fn prepare<F>(
        &self,
        lock_name: &str,
        mutate: F,
    ) -> Result<(RwLockWriteGuard<'_, ManifestState>, ClusterManifest, Vec<ProjectId>), HubError>
    where
        F: FnOnce(&mut ClusterManifest) -> Result<Vec<ProjectId>, HubError> + Send,
    {
        let mut state = self.manifest.write().await;
        self.refresh_manifest(&mut state).await?;

        let mut next = state.manifest.clone();
        let affected = mutate(&mut next)?;
        self.transition(lock_name, |op| op.affected_projects = affected.clone()).await;
        Ok((state, next, affected))
    }

    async fn check_leader(&self) -> Result<(), HubError> {
        let leader = self.leader.leader_id().await?;
        if leader.as_deref() != Some(self.node_id.as_str()) {
            return Err(HubError::NotLeader { leader });
        }
        Ok(())
    }

    /// Expected state of each affected project follows its desired flag on
    /// every known node. Per-node failures are logged and skipped.
    async fn sync_expected_states(&self, manifest: &ClusterManifest, affected: &[ProjectId]) {
        let mut nodes: Vec<NodeId> = match known_nodes(self.store.as_ref()).await {
            Ok(records) => records.into_iter().map(|r| r.node_id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot list nodes for expected state");
                Vec::new()
            }
        };
        if !nodes.contains(&self.node_id) {
            nodes.push(self.node_id.clone());
        }
        for project in affected {
            let desired = manifest.projects.get(project).is_some_and(|p| p.desired);
            for node in &nodes {
                if let Err(e) = self.tracker.set_expected_state(node, project, desired).await {
                    tracing::warn!(node = %node, project = %project, error = %e, "expected state write failed");
                }
            }
        }
    }

    async fn release(&self, lease: LockLease) {
        let name = lease.name.clone();
        if let Err(e) = self.locks.release(lease).await {
            tracing::warn!(lock = %name, error = %e, "lock release failed; it will expire");
        }
    }

    async fn transition(&self, lock_name: &str, f: impl FnOnce(&mut ComponentUpdateOperation)) {
        if let Some(op) = self.active.write().await.get_mut(lock_name) {
            f(op);
            op.last_update_ns = now_ns();
        }
    }

    async fn take_active(&self, lock_name: &str) -> Option<ComponentUpdateOperation> {
        self.active.write().await.remove(lock_name)
    }

    async fn finish(&self, mut op: ComponentUpdateOperation, result: Result<(), HubError>) {
        let finished = now_ns();
        if let Err(e) = &result {
            op.state = UpdateState::Failed;
            op.error = Some(e.to_string());
            tracing::warn!(id = %op.id, operation = %op.operation, subject = %op.subject, error = %e, "operation failed");
        } else {
            op.state = UpdateState::Idle;
            tracing::info!(id = %op.id, operation = %op.operation, subject = %op.subject, version = ?op.published_version, "operation completed");
        }
        self.archive
            .push(OperationRecord {
                outcome: OperationRecord::outcome_of(&result),
                id: op.id,
                operation: op.operation,
                subject: op.subject,
                started_at_ns: op.started_at_ns,
                finished_at_ns: finished,
                affected_projects: op.affected_projects,
                version: op.published_version,
                error_kind: result.as_ref().err().map(|e| e.kind().to_string()),
                error: op.error,
            })
            .await;
    }
}

/// Refresh `lease` until aborted. Flags `lost` once the lock is gone.
async fn keep_lease<S: CoordinationStore>(
    locks: DistributedLock<S>,
    lease: LockLease,
    every: Duration,
    lost: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match locks.refresh(&lease).await {
            Ok(()) => {}
            Err(e @ HubError::StaleLock { .. }) => {
                tracing::warn!(lock = %lease.name, error = %e, "lease lost during update");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => tracing::warn!(lock = %lease.name, error = %e, "lease refresh failed"),
        }
    }
}
