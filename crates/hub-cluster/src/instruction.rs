use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};

use hub_store::CoordinationStore;
use hub_types::{now_ns, HubError, InstructionVersion, KvEntry, NodeId};

use crate::codec::{decode, encode};
use crate::engine::{EngineReport, LocalEngine};
use crate::keys::{
    applied_version_key, execution_marker_key, heartbeat_key, instruction_key,
    parse_instruction_key, suffix, EXECUTION_MARKER_PREFIX, INSTRUCTION_ENTRY_PREFIX, INSTRUCTION_VERSION_KEY,
};
use crate::manifest::ClusterManifest;
use crate::operation::OperationType;
use crate::project_state::ProjectStateTracker;
use crate::settings::ClusterSettings;

pub const COMPACTION_STRATEGY: &str = "every_instruction";

/// A published change. Carries the full desired manifest, so applying the
/// latest instruction alone is enough to converge.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Instruction {
    pub version: InstructionVersion,
    pub operation: OperationType,
    pub subject: String,
    pub manifest: ClusterManifest,
    pub published_by: NodeId,
    pub published_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Followers were executing; nothing was deleted.
    Deferred { active: Vec<NodeId> },
    Compacted { removed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    UpToDate,
    Applied(InstructionVersion),
    /// The counter points at a version whose entry cannot be read yet.
    NotVisible(InstructionVersion),
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InstructionStats {
    pub current_version: Option<String>,
    /// Sequence part of the current version.
    pub instruction_count: u64,
    pub stored_instructions: usize,
    pub compaction_enabled: bool,
    pub should_compact: bool,
    pub active_followers: Vec<NodeId>,
    pub followers_executing: usize,
    pub can_compact_now: bool,
    pub compaction_strategy: &'static str,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CursorSnapshot {
    pub last_applied: Option<String>,
    pub last_applied_at_ns: Option<i64>,
    pub applied_count: u64,
    pub last_error: Option<String>,
}

struct Cursor {
    last_applied: InstructionVersion,
    last_applied_at_ns: Option<i64>,
    applied_count: u64,
    last_error: Option<String>,
}

/// Publishes instructions (leader) and applies them in order (followers).
pub struct InstructionManager<S, E> {
    store: Arc<S>,
    engine: Arc<E>,
    tracker: Arc<ProjectStateTracker<S>>,
    node_id: NodeId,
    epoch: u64,
    marker_ttl: Duration,
    /// Age after which another publisher's uncommitted entry may be reclaimed.
    orphan_grace: Duration,
    max_attempts: u32,
    publish_gate: Mutex<()>,
    apply_gate: Mutex<()>,
    cursor: RwLock<Cursor>,
}

fn decode_version(entry: &KvEntry) -> Result<InstructionVersion, HubError> {
    decode(&entry.value)
}

impl<S: CoordinationStore, E: LocalEngine> InstructionManager<S, E> {
    pub fn new(
        store: Arc<S>,
        engine: Arc<E>,
        tracker: Arc<ProjectStateTracker<S>>,
        node_id: NodeId,
        settings: &ClusterSettings,
    ) -> Self {
        InstructionManager {
            store,
            engine,
            tracker,
            node_id,
            epoch: settings.epoch,
            marker_ttl: settings.execution_marker_ttl(),
            orphan_grace: settings.node_timeout(),
            max_attempts: settings.publish_max_attempts,
            publish_gate: Mutex::new(()),
            apply_gate: Mutex::new(()),
            // Sequence 0 is never published, so a fresh node starts just
            // before the first instruction of its epoch.
            cursor: RwLock::new(Cursor {
                last_applied: InstructionVersion::new(settings.epoch, 0),
                last_applied_at_ns: None,
                applied_count: 0,
                last_error: None,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Leader side
    // -----------------------------------------------------------------------

    /// Write `manifest` as the next instruction and advance the counter.
    pub async fn publish(
        &self,
        operation: OperationType,
        subject: &str,
        manifest: ClusterManifest,
    ) -> Result<InstructionVersion, HubError> {
        self.publish_instruction(operation, subject, manifest).await.map(|i| i.version)
    }

    /// Like [`publish`](Self::publish), returning the stored instruction.
    ///
    /// The entry is written before the counter moves, so a reader that sees
    /// the counter can always read the entry. The publisher's own engine is
    /// not touched here; it applies the instruction like any follower.
    pub async fn publish_instruction(
        &self,
        operation: OperationType,
        subject: &str,
        manifest: ClusterManifest,
    ) -> Result<Instruction, HubError> {
        let _gate = self.publish_gate.lock().await;
        let mut attempt = 0u32;
        let instruction = loop {
            attempt += 1;
            let counter = self.store.get(INSTRUCTION_VERSION_KEY).await?;
            let current = counter.as_ref().map(decode_version).transpose()?;
            if let Some(c) = current {
                if c.epoch > self.epoch {
                    return Err(HubError::NotLeader { leader: None });
                }
            }
            let next = match current {
                Some(c) if c.epoch == self.epoch => c.next(),
                _ => InstructionVersion::new(self.epoch, 1),
            };

            let instruction = Instruction {
                version: next,
                operation,
                subject: subject.to_string(),
                manifest: manifest.clone(),
                published_by: self.node_id.clone(),
                published_at_ns: now_ns(),
            };
            let entry_bytes = encode(&instruction)?;
            let entry_key = instruction_key(next);

            if self.write_entry(&entry_key, entry_bytes.clone(), current).await? {
                let next_bytes = encode(&next)?;
                let swapped = match &counter {
                    Some(entry) => {
                        self.store
                            .compare_and_swap(
                                INSTRUCTION_VERSION_KEY,
                                entry.value.clone(),
                                next_bytes,
                                None,
                            )
                            .await?
                            .success
                    }
                    None => self.store.set_if_absent(INSTRUCTION_VERSION_KEY, next_bytes, None).await?,
                };
                if swapped {
                    self.confirm_entry(&entry_key, entry_bytes).await?;
                    break instruction;
                }
                // Whoever committed `next` owns the entry now.
                if self.current_version().await? != Some(next) {
                    self.store.compare_and_delete(&entry_key, entry_bytes).await?;
                }
            }

            let actual = self.current_version().await?.unwrap_or_default();
            tracing::debug!(attempt, wanted = %next, %actual, "instruction version conflict");
            if attempt >= self.max_attempts {
                return Err(HubError::VersionConflict {
                    expected: next.sequence.saturating_sub(1),
                    actual: actual.sequence,
                });
            }
            tokio::time::sleep(Duration::from_millis(2 * u64::from(attempt))).await;
        };

        tracing::info!(version = %instruction.version, %operation, subject, "instruction published");
        match self.compact().await {
            Ok(CompactionOutcome::Deferred { active }) => {
                tracing::debug!(?active, "compaction deferred")
            }
            Ok(CompactionOutcome::Compacted { removed }) if removed > 0 => {
                tracing::debug!(removed, "instructions compacted")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "compaction failed"),
        }
        Ok(instruction)
    }

    /// `Ok(false)` when a live publisher owns the entry key.
    ///
    /// An entry above the counter was never committed. It is reclaimed when
    /// it is our own, when its publisher has no heartbeat, or when it is
    /// older than the node timeout.
    async fn write_entry(
        &self,
        key: &str,
        bytes: Vec<u8>,
        committed: Option<InstructionVersion>,
    ) -> Result<bool, HubError> {
        if self.store.set_if_absent(key, bytes.clone(), None).await? {
            return Ok(true);
        }
        let Some(existing) = self.store.get(key).await? else {
            return Ok(false);
        };
        if self.current_version().await? != committed || !self.reclaimable(&existing).await? {
            return Ok(false);
        }
        tracing::warn!(key, "reclaiming uncommitted instruction entry");
        let outcome = self.store.compare_and_swap(key, existing.value, bytes, None).await?;
        Ok(outcome.success)
    }

    async fn reclaimable(&self, entry: &KvEntry) -> Result<bool, HubError> {
        let Ok(orphan) = decode::<Instruction>(&entry.value) else {
            return Ok(true);
        };
        if orphan.published_by == self.node_id {
            return Ok(true);
        }
        let age = now_ns().saturating_sub(orphan.published_at_ns);
        if age >= i64::try_from(self.orphan_grace.as_nanos()).unwrap_or(i64::MAX) {
            return Ok(true);
        }
        Ok(self.store.get(&heartbeat_key(&orphan.published_by)).await?.is_none())
    }

    /// The counter names our version now, so the entry must hold our bytes
    /// even if a reclaiming publisher replaced them in between.
    async fn confirm_entry(&self, key: &str, bytes: Vec<u8>) -> Result<(), HubError> {
        let intact = self.store.get(key).await?.is_some_and(|e| e.value == bytes);
        if !intact {
            tracing::warn!(key, "committed instruction entry was replaced, restoring it");
            self.store.set(key, bytes, None).await?;
        }
        Ok(())
    }

    pub async fn current_version(&self) -> Result<Option<InstructionVersion>, HubError> {
        self.store
            .get(INSTRUCTION_VERSION_KEY)
            .await?
            .as_ref()
            .map(decode_version)
            .transpose()
    }

    pub async fn instruction(
        &self,
        version: InstructionVersion,
    ) -> Result<Option<Instruction>, HubError> {
        match self.store.get(&instruction_key(version)).await? {
            Some(entry) => Ok(Some(decode(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Stored instruction versions, ascending.
    pub async fn instruction_versions(&self) -> Result<Vec<InstructionVersion>, HubError> {
        let mut versions: Vec<_> = self
            .store
            .scan_keys(INSTRUCTION_ENTRY_PREFIX)
            .await?
            .iter()
            .filter_map(|k| parse_instruction_key(k))
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// The newest published instruction, if any.
    pub async fn latest(&self) -> Result<Option<Instruction>, HubError> {
        match self.current_version().await? {
            Some(v) => self.instruction(v).await,
            None => Ok(None),
        }
    }

    /// Nodes with a live execution marker.
    pub async fn active_followers(&self) -> Result<Vec<NodeId>, HubError> {
        Ok(self
            .store
            .scan_keys(EXECUTION_MARKER_PREFIX)
            .await?
            .iter()
            .filter_map(|k| suffix(EXECUTION_MARKER_PREFIX, k).map(str::to_string))
            .collect())
    }

    pub async fn should_compact(&self) -> Result<bool, HubError> {
        Ok(!self.instruction_versions().await?.is_empty())
    }

    pub async fn can_compact_now(&self) -> Result<bool, HubError> {
        Ok(self.active_followers().await?.is_empty())
    }

    /// Delete every instruction older than the current one, unless a
    /// follower is executing.
    pub async fn compact(&self) -> Result<CompactionOutcome, HubError> {
        let active = self.active_followers().await?;
        if !active.is_empty() {
            return Ok(CompactionOutcome::Deferred { active });
        }
        let Some(current) = self.current_version().await? else {
            return Ok(CompactionOutcome::Compacted { removed: 0 });
        };
        let mut removed = 0;
        for version in self.instruction_versions().await? {
            if version >= current {
                break;
            }
            if self.store.delete(&instruction_key(version)).await? {
                removed += 1;
            }
        }
        Ok(CompactionOutcome::Compacted { removed })
    }

    pub async fn stats(&self) -> Result<InstructionStats, HubError> {
        let current = self.current_version().await?;
        let stored = self.instruction_versions().await?.len();
        let active = self.active_followers().await?;
        Ok(InstructionStats {
            current_version: current.map(|v| v.to_string()),
            instruction_count: current.map(|v| v.sequence).unwrap_or(0),
            stored_instructions: stored,
            compaction_enabled: true,
            should_compact: stored > 0,
            followers_executing: active.len(),
            can_compact_now: active.is_empty(),
            active_followers: active,
            compaction_strategy: COMPACTION_STRATEGY,
        })
    }

    // -----------------------------------------------------------------------
    // Follower side
    // -----------------------------------------------------------------------

    /// Restore `last_applied` from the store after a restart.
    pub async fn load_cursor(&self) -> Result<InstructionVersion, HubError> {
        let stored = match self.store.get(&applied_version_key(&self.node_id)).await? {
            Some(entry) => String::from_utf8_lossy(&entry.value).parse::<InstructionVersion>()?,
            None => InstructionVersion::default(),
        };
        let mut g = self.cursor.write().await;
        if stored > g.last_applied {
            g.last_applied = stored;
        }
        Ok(g.last_applied)
    }

    /// Restore the cursor after a restart and replay the current
    /// instruction, since a restarted engine comes up empty. When the replay
    /// fails the cursor stays just before the current version, so the next
    /// poll retries it.
    pub async fn resume(&self) -> Result<InstructionVersion, HubError> {
        let restored = self.load_cursor().await?;
        let Some(current) = self.current_version().await? else {
            return Ok(restored);
        };
        if restored < current {
            // The next poll applies a full snapshot anyway.
            return Ok(restored);
        }

        let _gate = self.apply_gate.lock().await;
        self.cursor.write().await.last_applied = current.prev();
        let Some(instruction) = self.instruction(current).await? else {
            tracing::warn!(%current, "current instruction not readable, replay left to polling");
            return Ok(self.last_applied().await);
        };
        match self.apply_locked(&instruction).await {
            Ok(_) => tracing::info!(%current, "current instruction replayed after restart"),
            Err(e @ HubError::ApplyFailure { .. }) => {
                tracing::warn!(%current, error = %e, "replay failed, polling will retry")
            }
            Err(e) => return Err(e),
        }
        Ok(self.last_applied().await)
    }

    pub async fn last_applied(&self) -> InstructionVersion {
        self.cursor.read().await.last_applied
    }

    pub async fn cursor(&self) -> CursorSnapshot {
        let g = self.cursor.read().await;
        CursorSnapshot {
            last_applied: (g.last_applied.sequence > 0).then(|| g.last_applied.to_string()),
            last_applied_at_ns: g.last_applied_at_ns,
            applied_count: g.applied_count,
            last_error: g.last_error.clone(),
        }
    }

    /// Apply at most one pending instruction: the direct successor when it is
    /// still stored, otherwise the latest snapshot.
    pub async fn poll_once(&self) -> Result<PollOutcome, HubError> {
        let _gate = self.apply_gate.lock().await;
        let Some(current) = self.current_version().await? else {
            return Ok(PollOutcome::UpToDate);
        };
        let last = self.last_applied().await;
        if current <= last {
            return Ok(PollOutcome::UpToDate);
        }

        let mut instruction = None;
        if last.epoch == current.epoch && last.next() < current {
            instruction = self.instruction(last.next()).await?;
            if instruction.is_none() {
                tracing::info!(%last, %current, "intermediate instructions compacted, applying latest");
            }
        }
        if instruction.is_none() {
            instruction = self.instruction(current).await?;
        }
        let Some(instruction) = instruction else {
            tracing::debug!(%current, "instruction not visible yet");
            return Ok(PollOutcome::NotVisible(current));
        };

        let version = instruction.version;
        self.apply_locked(&instruction).await?;
        Ok(PollOutcome::Applied(version))
    }

    /// Poll until nothing is pending. Returns the last applied version.
    pub async fn sync(&self) -> Result<InstructionVersion, HubError> {
        while let PollOutcome::Applied(_) = self.poll_once().await? {}
        Ok(self.last_applied().await)
    }

    /// Execute one instruction under this node's execution marker. Returns
    /// `Ok(false)` when it was already applied.
    pub async fn apply_instruction(&self, instruction: &Instruction) -> Result<bool, HubError> {
        let _gate = self.apply_gate.lock().await;
        self.apply_locked(instruction).await
    }

    /// Caller holds `apply_gate`.
    async fn apply_locked(&self, instruction: &Instruction) -> Result<bool, HubError> {
        let version = instruction.version;
        if version <= self.last_applied().await {
            tracing::debug!(%version, "instruction already applied, skipping");
            return Ok(false);
        }

        let marker = execution_marker_key(&self.node_id);
        self.store
            .set(&marker, version.to_string().into_bytes(), Some(self.marker_ttl))
            .await?;

        let result = self.execute(instruction).await;

        if let Err(e) = self.store.delete(&marker).await {
            tracing::warn!(%version, error = %e, "failed to clear execution marker; it will expire");
        }
        let result = match result {
            Ok(()) => self.record_applied(version).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(%version, operation = %instruction.operation, "instruction applied");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(%version, error = %e, "instruction apply failed");
                self.cursor.write().await.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(&self, instruction: &Instruction) -> Result<(), HubError> {
        let report = self.engine.apply(&instruction.manifest).await.map_err(|reason| {
            HubError::ApplyFailure { version: instruction.version.to_string(), reason }
        })?;
        self.report_states(&report).await
    }

    /// Self-report every project in `report`; projects this node still lists
    /// but the engine no longer reports are removed.
    async fn report_states(&self, report: &EngineReport) -> Result<(), HubError> {
        for (project, status) in &report.statuses {
            self.tracker.set_real_state(&self.node_id, project, *status).await?;
        }
        for project in self.tracker.get_real_states(&self.node_id).await?.into_keys() {
            if !report.statuses.contains_key(&project) {
                self.tracker.remove_project(&project).await?;
            }
        }
        Ok(())
    }

    async fn record_applied(&self, version: InstructionVersion) -> Result<(), HubError> {
        self.store
            .set(&applied_version_key(&self.node_id), version.to_string().into_bytes(), None)
            .await?;
        let mut g = self.cursor.write().await;
        if version > g.last_applied {
            g.last_applied = version;
        }
        g.last_applied_at_ns = Some(now_ns());
        g.applied_count += 1;
        g.last_error = None;
        Ok(())
    }

    /// Remove this node's execution marker, e.g. on shutdown.
    pub async fn clear_marker(&self) -> Result<(), HubError> {
        self.store.delete(&execution_marker_key(&self.node_id)).await.map(|_| ())
    }

    /// Poll every `interval` until `shutdown` flips.
    pub async fn run_follower(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
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
            if let Err(e) = self.sync().await {
                tracing::warn!(node = %self.node_id, error = %e, "instruction poll failed");
            }
        }
        tracing::debug!(node = %self.node_id, "follower loop stopped");
    }
}
