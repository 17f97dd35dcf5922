//! Keyed mutual exclusion, either within one process or across every
//! process sharing a key-value store.

mod backend;
mod distributed;
mod local;

pub use backend::{LockBackend, LockManager};
pub use distributed::{DistributedLockManager, DEFAULT_KEY_PREFIX, DEFAULT_RETRY_INTERVAL};
pub use local::LocalLockManager;
