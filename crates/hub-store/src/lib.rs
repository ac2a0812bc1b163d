pub mod fjall;
pub mod keys;
pub mod mem;
pub mod timeout;
pub mod traits;
pub mod ttl;

pub use self::fjall::FjallStore;
pub use mem::MemStore;
pub use timeout::TimeoutStore;
pub use traits::CoordinationStore;
pub use ttl::TtlSweeper;
