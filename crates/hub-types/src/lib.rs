use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable, address-derived node identifier (e.g. `"10.0.0.4:8080"`).
pub type NodeId = String;
pub type ProjectId = String;

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Stored per key by every coordination store backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Store-wide modification counter at the time of the last write.
    pub version: u64,
    pub created_at_ns: i64,
    pub modified_at_ns: i64,
    pub expires_at_ns: Option<i64>,
}

impl KvEntry {
    pub fn is_expired(&self, now_ns: i64) -> bool {
        matches!(self.expires_at_ns, Some(exp) if exp <= now_ns)
    }
}

/// Result of a compare-and-swap against the store.
#[derive(Debug, Clone)]
pub struct CasOutcome {
    pub success: bool,
    /// Value observed before the swap was attempted.
    pub current: Option<KvEntry>,
}

// ---------------------------------------------------------------------------
// Project status
// ---------------------------------------------------------------------------

/// Runtime status of a project on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Stopping => "stopping",
            ProjectStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ProjectStatus::Stopped),
            "starting" => Ok(ProjectStatus::Starting),
            "running" => Ok(ProjectStatus::Running),
            "stopping" => Ok(ProjectStatus::Stopping),
            "error" => Ok(ProjectStatus::Error),
            other => Err(HubError::InvalidArgument(format!("unknown project status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Instruction version
// ---------------------------------------------------------------------------

/// `epoch.sequence`, ordered by epoch first, then sequence.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
pub struct InstructionVersion {
    pub epoch: u64,
    pub sequence: u64,
}

impl InstructionVersion {
    pub const fn new(epoch: u64, sequence: u64) -> Self {
        InstructionVersion { epoch, sequence }
    }

    /// The version directly following `self` within the same epoch.
    pub fn next(self) -> Self {
        InstructionVersion { epoch: self.epoch, sequence: self.sequence + 1 }
    }

    /// The version directly before `self`; sequence 0 stays at 0.
    pub fn prev(self) -> Self {
        InstructionVersion { epoch: self.epoch, sequence: self.sequence.saturating_sub(1) }
    }

    /// True when `other` directly follows `self` with nothing in between.
    pub fn is_successor(self, other: InstructionVersion) -> bool {
        self.epoch == other.epoch && self.sequence + 1 == other.sequence
    }
}

impl fmt::Display for InstructionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.sequence)
    }
}

impl FromStr for InstructionVersion {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HubError::InvalidArgument(format!("invalid instruction version '{s}'"));
        let (epoch, sequence) = s.split_once('.').ok_or_else(invalid)?;
        Ok(InstructionVersion {
            epoch: epoch.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    /// Resolve a node's role from the authoritative leader ID.
    pub fn resolve(node_id: &str, leader_id: Option<&str>) -> Role {
        match leader_id {
            Some(leader) if leader == node_id => Role::Leader,
            _ => Role::Follower,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("lock '{resource}' is busy (held by {holder:?})")]
    LockBusy { resource: String, holder: Option<NodeId> },
    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("instruction {version} rejected by local engine: {reason}")]
    ApplyFailure { version: String, reason: String },
    #[error("lock '{resource}' is no longer held by {owner}")]
    StaleLock { resource: String, owner: NodeId },
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<NodeId> },
    #[error("operation timed out")]
    Timeout,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl HubError {
    /// Machine-readable error kind for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::StoreUnavailable(_) => "store_unavailable",
            HubError::LockBusy { .. } => "lock_busy",
            HubError::VersionConflict { .. } => "version_conflict",
            HubError::ApplyFailure { .. } => "apply_failure",
            HubError::StaleLock { .. } => "stale_lock",
            HubError::NotLeader { .. } => "not_leader",
            HubError::Timeout => "timeout",
            HubError::InvalidArgument(_) => "invalid_argument",
            HubError::Codec(_) => "codec",
        }
    }
}
