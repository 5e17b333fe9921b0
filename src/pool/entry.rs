//! Pool entries

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::types::BotIdentity;
use crate::worker::WorkerHandle;

/// A resolved bot: its worker plus the activity bookkeeping used for eviction
pub struct PoolEntry {
    identity: BotIdentity,
    worker: WorkerHandle,
    spawned_at: DateTime<Utc>,
    /// Milliseconds on the pool clock; only ever moves forward
    last_activity_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl PoolEntry {
    pub fn new(identity: BotIdentity, worker: WorkerHandle, now_ms: u64) -> Self {
        Self {
            identity,
            worker,
            spawned_at: Utc::now(),
            last_activity_ms: AtomicU64::new(now_ms),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    /// Record activity at `now_ms`
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::SeqCst);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_activity_ms()))
    }

    /// Asks currently waiting on this worker
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Marks an ask as in progress for as long as it is held
pub(crate) struct InFlight {
    entry: Arc<PoolEntry>,
}

impl InFlight {
    pub(crate) fn begin(entry: Arc<PoolEntry>, now_ms: u64) -> Self {
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        entry.touch(now_ms);
        Self { entry }
    }

    pub(crate) fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Responder, TaskSpawner, WorkerSpawner};
    use crate::types::BotDefinition;

    struct Echo;

    impl Responder for Echo {
        fn respond(&mut self, question: &str) -> std::result::Result<String, String> {
            Ok(question.to_string())
        }
    }

    async fn entry(now_ms: u64) -> Arc<PoolEntry> {
        let spawner = TaskSpawner::new(|_, _| Ok(Box::new(Echo) as Box<dyn Responder>));
        let worker = spawner
            .spawn(&"b1".into(), &BotDefinition::new(b"{}".to_vec()))
            .await
            .unwrap();
        Arc::new(PoolEntry::new("b1".into(), worker, now_ms))
    }

    #[tokio::test]
    async fn test_touch_never_moves_backwards() {
        let entry = entry(1_000).await;
        entry.touch(5_000);
        entry.touch(3_000);
        assert_eq!(entry.last_activity_ms(), 5_000);
        assert_eq!(entry.idle_for(6_500), Duration::from_millis(1_500));
        assert_eq!(entry.idle_for(4_000), Duration::ZERO);
        entry.worker().terminate().await;
    }

    #[tokio::test]
    async fn test_in_flight_guard() {
        let entry = entry(0).await;
        {
            let first = InFlight::begin(Arc::clone(&entry), 10);
            let _second = InFlight::begin(Arc::clone(first.entry()), 20);
            assert_eq!(entry.in_flight(), 2);
            assert_eq!(entry.last_activity_ms(), 20);
        }
        assert_eq!(entry.in_flight(), 0);
        entry.worker().terminate().await;
    }
}
