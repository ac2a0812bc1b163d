use std::time::Duration;

use hub_types::HubError;

/// Timing and sizing knobs for the coordination layer.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Leadership epoch used when this node publishes instructions.
    pub epoch: u64,
    pub heartbeat_interval_ms: u64,
    /// A node whose heartbeat is older than this is considered dead; also the
    /// heartbeat key TTL.
    pub node_timeout_secs: u64,
    pub instruction_poll_interval_ms: u64,
    /// Upper bound on how long a crashed follower can block compaction.
    pub execution_marker_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    pub lock_refresh_interval_secs: u64,
    /// Wall-clock limit for one component update before it is force-failed.
    pub update_timeout_secs: u64,
    pub publish_max_attempts: u32,
    pub operation_history: usize,
    pub ttl_sweep_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            epoch: 1,
            heartbeat_interval_ms: 5_000,
            node_timeout_secs: 30,
            instruction_poll_interval_ms: 1_000,
            execution_marker_ttl_secs: 60,
            lock_ttl_secs: 30,
            lock_refresh_interval_secs: 10,
            update_timeout_secs: 120,
            publish_max_attempts: 5,
            operation_history: 100,
            ttl_sweep_interval_ms: 1_000,
        }
    }
}

impl ClusterSettings {
    pub fn validate(&self) -> Result<(), HubError> {
        if self.epoch == 0 {
            return Err(HubError::InvalidArgument("epoch must be at least 1".into()));
        }
        if self.lock_ttl_secs == 0 || self.execution_marker_ttl_secs == 0 {
            return Err(HubError::InvalidArgument("lease TTLs must be non-zero".into()));
        }
        if self.lock_refresh_interval_secs == 0
            || self.lock_refresh_interval_secs >= self.lock_ttl_secs
        {
            return Err(HubError::InvalidArgument(format!(
                "lock_refresh_interval_secs ({}) must be non-zero and below lock_ttl_secs ({})",
                self.lock_refresh_interval_secs, self.lock_ttl_secs
            )));
        }
        if self.heartbeat_interval_ms >= self.node_timeout_secs.saturating_mul(1_000) {
            return Err(HubError::InvalidArgument(
                "heartbeat_interval_ms must be shorter than node_timeout_secs".into(),
            ));
        }
        if self.publish_max_attempts == 0 {
            return Err(HubError::InvalidArgument("publish_max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn instruction_poll_interval(&self) -> Duration {
        Duration::from_millis(self.instruction_poll_interval_ms)
    }

    pub fn execution_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.execution_marker_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lock_refresh_interval_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }

    pub fn ttl_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_sweep_interval_ms)
    }
}
