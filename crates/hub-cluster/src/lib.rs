//! Coordination layer of a hub cluster: distributed locks, project state
//! tracking, versioned instruction distribution and guarded component
//! updates, all on top of a shared [`CoordinationStore`](hub_store::CoordinationStore).

mod codec;

pub mod component_update;
pub mod context;
pub mod engine;
pub mod heartbeat;
pub mod instruction;
pub mod keys;
pub mod leader;
pub mod lifecycle;
pub mod lock;
pub mod manifest;
pub mod operation;
pub mod project_state;
pub mod settings;
pub mod status;

pub use component_update::{ComponentUpdateManager, ComponentUpdateOperation, UpdateReceipt, UpdateState};
pub use context::ClusterContext;
pub use engine::{EngineReport, InMemoryEngine, LocalEngine};
pub use heartbeat::{Heartbeat, HeartbeatRecord};
pub use instruction::{Instruction, InstructionManager, InstructionStats};
pub use leader::{Leader, LeaderSource, StaticLeader, StoreLeader};
pub use lifecycle::ProjectController;
pub use lock::{DistributedLock, LockLease};
pub use manifest::{ClusterManifest, ComponentChange, ComponentKey, ComponentKind};
pub use operation::{OperationArchive, OperationRecord, OperationType};
pub use project_state::ProjectStateTracker;
pub use settings::ClusterSettings;
pub use status::{ClusterSnapshot, ClusterStatusAggregator, FollowerExecutionStatus};
