use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use hub_types::{ProjectId, ProjectStatus};

use crate::manifest::ClusterManifest;

/// Per-project outcome of one apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub statuses: BTreeMap<ProjectId, ProjectStatus>,
}

// ---------------------------------------------------------------------------
// LocalEngine trait
// ---------------------------------------------------------------------------

/// The node-local component runtime. Receives the full desired manifest and
/// converges to it; an `Err` carries the rejection reason.
pub trait LocalEngine: Send + Sync + 'static {
    fn apply(
        &self,
        manifest: &ClusterManifest,
    ) -> impl Future<Output = Result<EngineReport, String>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryEngine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineInner {
    /// Running projects and the generation they were started at.
    running: BTreeMap<ProjectId, u64>,
    reject: Option<String>,
    delay: Option<Duration>,
    applies: u64,
    restarts: u64,
}

/// Deterministic engine: a project runs when desired and all its components
/// are defined, errors when a reference is missing, and is stopped otherwise.
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    inner: Arc<RwLock<EngineInner>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent apply fail with `reason` (`None` to recover).
    pub async fn set_rejecting(&self, reason: Option<String>) {
        self.inner.write().await.reject = reason;
    }

    /// Hold every apply for `delay` before converging.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.inner.write().await.delay = delay;
    }

    pub async fn apply_count(&self) -> u64 {
        self.inner.read().await.applies
    }

    pub async fn restart_count(&self) -> u64 {
        self.inner.read().await.restarts
    }

    pub async fn running_projects(&self) -> Vec<ProjectId> {
        self.inner.read().await.running.keys().cloned().collect()
    }
}

impl LocalEngine for InMemoryEngine {
    async fn apply(&self, manifest: &ClusterManifest) -> Result<EngineReport, String> {
        let delay = self.inner.read().await.delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut g = self.inner.write().await;
        g.applies += 1;
        if let Some(reason) = &g.reject {
            return Err(reason.clone());
        }

        let mut report = EngineReport::default();
        let mut running = BTreeMap::new();
        for (id, project) in &manifest.projects {
            let status = if !manifest.missing_components(id).is_empty() {
                ProjectStatus::Error
            } else if project.desired {
                if matches!(g.running.get(id), Some(started) if *started != project.generation) {
                    g.restarts += 1;
                }
                running.insert(id.clone(), project.generation);
                ProjectStatus::Running
            } else {
                ProjectStatus::Stopped
            };
            report.statuses.insert(id.clone(), status);
        }
        g.running = running;
        Ok(report)
    }
}
