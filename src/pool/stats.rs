//! Pool counters and status snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::types::BotIdentity;

/// Lifetime counters for one pool
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Asks served by an already running worker
    pub local_reuses: u64,
    /// Definitions found in the directory cache
    pub cache_hits: u64,
    /// Definitions fetched from the backend store
    pub cold_starts: u64,
    pub spawns: u64,
    /// Idle entries removed by a sweep
    pub evictions: u64,
    /// Entries removed because their worker died
    pub crash_evictions: u64,
    /// Evictions whose directory cleanup had to be deferred
    pub eviction_failures: u64,
    pub sweeps: u64,
}

/// One live entry as reported by `/status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryStatus {
    pub identity: BotIdentity,
    pub worker_id: Uuid,
    pub pid: Option<u32>,
    pub running: bool,
    pub idle_secs: u64,
    pub in_flight: usize,
    pub spawned_at: DateTime<Utc>,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub server_addr: String,
    pub entries: Vec<EntryStatus>,
    /// Slots locked by an ongoing resolve or eviction when the snapshot was taken
    pub busy: usize,
    pub pending_withdrawals: Vec<BotIdentity>,
    pub stats: PoolStats,
}

/// Outcome of one garbage collection sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub kept: usize,
    pub evicted: Vec<BotIdentity>,
    /// Slots skipped because a resolve was holding them
    pub busy: usize,
    /// Evictions whose directory cleanup failed and was deferred
    pub deferred: usize,
    /// Deferred withdrawals completed on this sweep
    pub withdrawn: usize,
}
