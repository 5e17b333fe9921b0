//! Bot instance pool
//!
//! [`PoolManager`] resolves identities to local workers and answers asks;
//! [`GarbageCollector`] evicts the ones nobody has talked to for a while.

pub mod collector;
pub mod entry;
pub mod manager;
pub mod stats;

pub use collector::GarbageCollector;
pub use entry::PoolEntry;
pub use manager::{PoolConfig, PoolManager, DEFAULT_GC_INTERVAL, DEFAULT_IDLE_THRESHOLD};
pub use stats::{EntryStatus, PoolStats, PoolStatus, SweepReport};
