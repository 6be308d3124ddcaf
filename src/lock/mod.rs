//! Locking tiers
//!
//! Two tiers cooperate around origin loads: a process-local keyed lock pool
//! with bounded two-list eviction, and a cluster-wide lease lock on Redis.
//! The breakdown guard composes them; nothing else in the engine takes
//! locks directly.

mod distributed;
mod pool;

pub use distributed::{RedisLeaseLock, with_lock};
pub use pool::{LockHandle, LockPool, LockPoolSnapshot, LockReference};
