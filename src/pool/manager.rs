//! Pool manager
//!
//! Maps each bot identity to at most one local worker. Every identity gets
//! its own async slot in a concurrent map: resolving, evicting and crash
//! cleanup for one bot are serialized on that slot, while different bots
//! never wait on each other.
//!
//! Resolution order for an unseen identity:
//!
//! 1. definition from the directory cache, else
//! 2. definition from the backend store (then written to the cache)
//! 3. spawn the worker and publish `BOT-<id>` / `SERVER-<addr>`
//!
//! A worker whose ownership cannot be published is stopped again before
//! the error is returned.

use dashmap::{DashMap, DashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::entry::{InFlight, PoolEntry};
use super::stats::{EntryStatus, PoolStats, PoolStatus, SweepReport};
use crate::backend::BackendStore;
use crate::config::Args;
use crate::directory::Directory;
use crate::retry::RetryPolicy;
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};
use crate::worker::WorkerSpawner;

/// Per-identity slot. `None` while a resolve is in progress or after a failed one.
type Slot = Arc<Mutex<Option<Arc<PoolEntry>>>>;

/// Default time between sweeps
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default inactivity after which an entry is evicted
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Configuration for the pool manager
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries idle at least this long are evicted by the next sweep
    pub idle_threshold: Duration,
    /// Time between sweeps
    pub gc_interval: Duration,
    /// Bound on a single ask, `None` waits for the worker
    pub ask_timeout: Option<Duration>,
    /// Retry policy for backend fetches
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            gc_interval: DEFAULT_GC_INTERVAL,
            ask_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            idle_threshold: args.idle_threshold(),
            gc_interval: args.gc_interval(),
            ask_timeout: args.ask_timeout(),
            retry: RetryPolicy {
                max_attempts: args.store_retry_attempts,
                base_delay: args.store_retry_base(),
            },
        }
    }
}

/// Owns every local worker of this server
pub struct PoolManager {
    config: PoolConfig,
    directory: Directory,
    backend: Arc<dyn BackendStore>,
    spawner: Arc<dyn WorkerSpawner>,
    slots: DashMap<BotIdentity, Slot>,
    /// Evicted identities whose directory records are still to be removed
    pending_withdrawals: DashSet<BotIdentity>,
    /// One sweep at a time
    sweep_lock: Mutex<()>,
    stats: RwLock<PoolStats>,
    /// Zero point of the activity clock
    epoch: Instant,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        directory: Directory,
        backend: Arc<dyn BackendStore>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            config,
            directory,
            backend,
            spawner,
            slots: DashMap::new(),
            pending_withdrawals: DashSet::new(),
            sweep_lock: Mutex::new(()),
            stats: RwLock::new(PoolStats::default()),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn record(&self, update: impl FnOnce(&mut PoolStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Announce this server in the directory and drop records left by a
    /// previous run under the same address.
    pub async fn register_server(&self) -> Result<Vec<BotIdentity>> {
        let reclaimed = self.directory.register_server().await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed stale bot records from a previous run");
        }
        Ok(reclaimed)
    }

    /// Ask `identity` a question and wait for its answer.
    ///
    /// Resolves (and if needed starts) the bot first. Asks for the same bot
    /// are answered in the order they reach its worker.
    pub async fn ask(&self, question: impl Into<String>, identity: &BotIdentity) -> Result<String> {
        let flight = self.checkout(identity).await?;
        let entry = Arc::clone(flight.entry());

        let result = entry
            .worker()
            .ask(question.into(), self.config.ask_timeout)
            .await;
        entry.touch(self.now_ms());
        drop(flight);

        if let Err(PoolError::WorkerCrash(reason)) = &result {
            warn!(identity = %identity, "Worker crashed, evicting: {}", reason);
            self.evict_crashed(&entry).await;
        }
        result
    }

    /// Resolve `identity` to a running worker, starting one if needed
    pub async fn resolve(&self, identity: &BotIdentity) -> Result<Arc<PoolEntry>> {
        let flight = self.checkout(identity).await?;
        Ok(Arc::clone(flight.entry()))
    }

    /// Resolve and mark an ask as in flight while the slot is still held,
    /// so a sweep can never evict between the two.
    async fn checkout(&self, identity: &BotIdentity) -> Result<InFlight> {
        loop {
            let slot = Arc::clone(self.slots.entry(identity.clone()).or_default().value());
            let mut guard = slot.lock().await;

            // Evicted and unmapped while we waited
            if !self.is_current(identity, &slot) {
                continue;
            }

            if let Some(entry) = guard.as_ref() {
                if entry.worker().is_running() {
                    self.record(|s| s.local_reuses += 1);
                    debug!(identity = %identity, "Reusing bot instance");
                    return Ok(InFlight::begin(Arc::clone(entry), self.now_ms()));
                }
            }

            if let Some(dead) = guard.take() {
                warn!(
                    identity = %identity,
                    worker_id = %dead.worker().worker_id(),
                    "Replacing dead worker"
                );
                self.retire(&dead).await;
                self.record(|s| s.crash_evictions += 1);
            }

            return match self.instantiate(identity).await {
                Ok(entry) => {
                    let flight = InFlight::begin(Arc::clone(&entry), self.now_ms());
                    *guard = Some(entry);
                    Ok(flight)
                }
                Err(e) => {
                    self.slots
                        .remove_if(identity, |_, current| Arc::ptr_eq(current, &slot));
                    Err(e)
                }
            };
        }
    }

    fn is_current(&self, identity: &BotIdentity, slot: &Slot) -> bool {
        self.slots
            .get(identity)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Start a worker for `identity` and publish it. Caller holds the slot.
    async fn instantiate(&self, identity: &BotIdentity) -> Result<Arc<PoolEntry>> {
        let definition = self.load_definition(identity).await?;

        let worker = self.spawner.spawn(identity, &definition).await?;
        self.record(|s| s.spawns += 1);

        if let Err(e) = self.directory.publish_ownership(identity).await {
            error!(identity = %identity, "Failed to publish ownership, stopping worker: {}", e);
            worker.terminate().await;
            return Err(match e {
                PoolError::DirectoryWrite(_) => e,
                other => PoolError::DirectoryWrite(other.to_string()),
            });
        }
        // Records are fresh again; an older deferred withdrawal would erase them
        self.pending_withdrawals.remove(identity);

        info!(
            identity = %identity,
            worker_id = %worker.worker_id(),
            addr = %self.directory.server_addr(),
            "Bot instance started"
        );
        Ok(Arc::new(PoolEntry::new(identity.clone(), worker, self.now_ms())))
    }

    async fn load_definition(&self, identity: &BotIdentity) -> Result<BotDefinition> {
        match self.directory.cached_definition(identity).await {
            Ok(Some(definition)) => {
                self.record(|s| s.cache_hits += 1);
                debug!(identity = %identity, bytes = definition.len(), "Definition found in directory cache");
                return Ok(definition);
            }
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, "Definition cache lookup failed, using backend: {}", e),
        }

        let backend = &self.backend;
        let definition = self
            .config
            .retry
            .run(identity.as_str(), move || backend.fetch_definition(identity))
            .await?;
        self.record(|s| s.cold_starts += 1);
        info!(identity = %identity, bytes = definition.len(), "Fetched definition from backend");

        if let Err(e) = self.directory.cache_definition(identity, &definition).await {
            warn!(identity = %identity, "Failed to cache definition: {}", e);
        }
        Ok(definition)
    }

    /// Withdraw directory records and stop the worker.
    ///
    /// Returns false when the withdrawal was deferred to a later sweep.
    async fn retire(&self, entry: &PoolEntry) -> bool {
        let identity = entry.identity();
        let withdrawn = match self.directory.withdraw_ownership(identity).await {
            Ok(()) => true,
            Err(e) => {
                warn!(identity = %identity, "Failed to remove directory records, retrying next sweep: {}", e);
                self.pending_withdrawals.insert(identity.clone());
                self.record(|s| s.eviction_failures += 1);
                false
            }
        };
        entry.worker().terminate().await;
        withdrawn
    }

    async fn evict_crashed(&self, entry: &Arc<PoolEntry>) {
        let identity = entry.identity();
        let Some(slot) = self.slots.get(identity).map(|s| Arc::clone(s.value())) else {
            entry.worker().terminate().await;
            return;
        };

        let mut guard = slot.lock().await;
        let owned = guard
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if !owned {
            // Already replaced or evicted
            drop(guard);
            entry.worker().terminate().await;
            return;
        }

        guard.take();
        self.retire(entry).await;
        self.slots
            .remove_if(identity, |_, current| Arc::ptr_eq(current, &slot));
        self.record(|s| s.crash_evictions += 1);
    }

    /// Evict every entry idle for at least the threshold.
    ///
    /// Entries with an ask in progress and slots busy resolving are left for
    /// the next sweep. A failure on one entry never stops the rest.
    pub async fn sweep(&self) -> SweepReport {
        let _sweeping = self.sweep_lock.lock().await;
        let threshold = self.config.idle_threshold;
        let now = self.now_ms();
        let mut report = SweepReport::default();

        let slots: Vec<(BotIdentity, Slot)> = self
            .slots
            .iter()
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect();

        for (identity, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                report.busy += 1;
                continue;
            };
            let Some(entry) = guard.as_ref().map(Arc::clone) else {
                continue;
            };

            if entry.in_flight() > 0 {
                debug!(identity = %identity, "Keeping bot with an ask in progress");
                report.kept += 1;
                continue;
            }

            let idle = entry.idle_for(now);
            if idle < threshold && entry.worker().is_running() {
                report.kept += 1;
                continue;
            }

            info!(identity = %identity, idle_secs = idle.as_secs(), "Evicting idle bot instance");
            guard.take();
            if !self.retire(&entry).await {
                report.deferred += 1;
            }
            self.slots
                .remove_if(&identity, |_, current| Arc::ptr_eq(current, &slot));
            drop(guard);

            self.record(|s| s.evictions += 1);
            report.evicted.push(identity);
        }

        report.withdrawn = self.retry_withdrawals().await;
        self.record(|s| s.sweeps += 1);

        info!(
            kept = report.kept,
            evicted = report.evicted.len(),
            busy = report.busy,
            deferred = report.deferred,
            "Garbage collection sweep finished"
        );
        report
    }

    /// Retry deferred withdrawals for identities that have no local entry
    async fn retry_withdrawals(&self) -> usize {
        let pending: Vec<BotIdentity> = self
            .pending_withdrawals
            .iter()
            .map(|id| id.key().clone())
            .collect();

        let mut withdrawn = 0;
        for identity in pending {
            let slot = Arc::clone(self.slots.entry(identity.clone()).or_default().value());
            let Ok(guard) = slot.try_lock() else {
                continue;
            };

            if guard.is_some() {
                // Running again here; its records are current
                self.pending_withdrawals.remove(&identity);
                continue;
            }

            match self.directory.withdraw_ownership(&identity).await {
                Ok(()) => {
                    self.pending_withdrawals.remove(&identity);
                    withdrawn += 1;
                    debug!(identity = %identity, "Completed deferred withdrawal");
                }
                Err(e) => warn!(identity = %identity, "Deferred withdrawal failed again: {}", e),
            }
            self.slots
                .remove_if(&identity, |_, current| Arc::ptr_eq(current, &slot));
            drop(guard);
        }
        withdrawn
    }

    /// Stop every worker and withdraw all ownership records
    pub async fn shutdown(&self) -> usize {
        let _sweeping = self.sweep_lock.lock().await;
        let slots: Vec<(BotIdentity, Slot)> = self
            .slots
            .iter()
            .map(|s| (s.key().clone(), Arc::clone(s.value())))
            .collect();

        let mut stopped = 0;
        for (identity, slot) in slots {
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.take() {
                self.retire(&entry).await;
                stopped += 1;
            }
            self.slots
                .remove_if(&identity, |_, current| Arc::ptr_eq(current, &slot));
        }
        self.retry_withdrawals().await;

        info!(stopped, "Pool shut down");
        stopped
    }

    /// The live entry for `identity`, without starting one
    pub async fn entry(&self, identity: &BotIdentity) -> Option<Arc<PoolEntry>> {
        let slot = self.slots.get(identity).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock().await;
        guard.as_ref().map(Arc::clone)
    }

    /// Number of live entries
    pub async fn entry_count(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub fn pending_withdrawals(&self) -> Vec<BotIdentity> {
        let mut pending: Vec<BotIdentity> = self
            .pending_withdrawals
            .iter()
            .map(|id| id.key().clone())
            .collect();
        pending.sort();
        pending
    }

    /// Snapshot for `/status`. Slots locked at that moment are only counted.
    pub fn status(&self) -> PoolStatus {
        let now = self.now_ms();
        let mut entries = Vec::new();
        let mut busy = 0;

        for slot in self.slots.iter() {
            match slot.value().try_lock() {
                Ok(guard) => {
                    if let Some(entry) = guard.as_ref() {
                        entries.push(EntryStatus {
                            identity: entry.identity().clone(),
                            worker_id: entry.worker().worker_id(),
                            pid: entry.worker().pid(),
                            running: entry.worker().is_running(),
                            idle_secs: entry.idle_for(now).as_secs(),
                            in_flight: entry.in_flight(),
                            spawned_at: entry.spawned_at(),
                        });
                    }
                }
                Err(_) => busy += 1,
            }
        }
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));

        PoolStatus {
            server_addr: self.directory.server_addr().to_string(),
            entries,
            busy,
            pending_withdrawals: self.pending_withdrawals(),
            stats: self.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::directory::{DirectoryStore, MemoryDirectory};
    use crate::worker::{Responder, TaskSpawner};

    struct Echo;

    impl Responder for Echo {
        fn respond(&mut self, question: &str) -> std::result::Result<String, String> {
            Ok(format!("echo: {}", question))
        }
    }

    struct Fixture {
        pool: PoolManager,
        store: Arc<MemoryDirectory>,
        backend: Arc<MemoryBackend>,
        spawner: Arc<TaskSpawner>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDirectory::new());
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b1", BotDefinition::new(b"D1".to_vec()));
        backend.insert("b2", BotDefinition::new(b"D2".to_vec()));
        let spawner = Arc::new(TaskSpawner::new(|_, _| Ok(Box::new(Echo) as Box<dyn Responder>)));

        let pool = PoolManager::new(
            PoolConfig {
                retry: RetryPolicy::none(),
                ..PoolConfig::default()
            },
            Directory::new(store.clone(), "10.0.0.1", RetryPolicy::none()),
            backend.clone(),
            spawner.clone(),
        );
        Fixture {
            pool,
            store,
            backend,
            spawner,
        }
    }

    #[tokio::test]
    async fn test_cold_start_then_reuse() {
        let f = fixture();
        let b1 = BotIdentity::from("b1");

        assert_eq!(f.pool.ask("hi", &b1).await.unwrap(), "echo: hi");
        let first = f.pool.entry(&b1).await.unwrap().worker().worker_id();
        assert_eq!(f.pool.ask("again", &b1).await.unwrap(), "echo: again");
        let second = f.pool.entry(&b1).await.unwrap().worker().worker_id();

        assert_eq!(first, second);
        assert_eq!(f.spawner.spawn_count(), 1);
        assert_eq!(f.backend.fetch_count(), 1);

        let stats = f.pool.stats();
        assert_eq!(stats.cold_starts, 1);
        assert_eq!(stats.local_reuses, 1);
        assert!(f.store.contains("b1"));
    }

    #[tokio::test]
    async fn test_directory_cache_skips_backend() {
        let f = fixture();
        f.store
            .set("b3", bytes::Bytes::from_static(b"D3"))
            .await
            .unwrap();

        f.pool.ask("hi", &"b3".into()).await.unwrap();
        assert_eq!(f.backend.fetch_count(), 0);
        assert_eq!(f.pool.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_unknown_bot_leaves_no_slot() {
        let f = fixture();
        let err = f.pool.ask("hi", &"nope".into()).await.unwrap_err();
        assert!(matches!(err, PoolError::DefinitionNotFound(_)));
        assert_eq!(f.pool.entry_count().await, 0);
        assert_eq!(f.spawner.spawn_count(), 0);
        assert!(!f.store.contains("BOT-nope"));
    }

    #[tokio::test]
    async fn test_cache_write_failure_is_not_fatal() {
        let f = fixture();
        f.store.set_fail_writes(true);
        // Publishing still fails, but only after the cache write was skipped
        let err = f.pool.ask("hi", &"b1".into()).await.unwrap_err();
        assert!(matches!(err, PoolError::DirectoryWrite(_)));
        assert_eq!(f.spawner.spawn_count(), 1);
        assert_eq!(f.pool.entry_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_fresh_entries() {
        let f = fixture();
        f.pool.ask("hi", &"b1".into()).await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        f.pool.ask("hi", &"b2".into()).await.unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;

        let report = f.pool.sweep().await;
        assert_eq!(report.evicted, vec![BotIdentity::from("b1")]);
        assert_eq!(report.kept, 1);
        assert!(f.pool.entry(&"b1".into()).await.is_none());
        assert!(f.pool.entry(&"b2".into()).await.is_some());
        assert!(!f.store.contains("BOT-b1"));
        assert!(f.store.contains("BOT-b2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_withdrawal_is_retried() {
        let f = fixture();
        let b1 = BotIdentity::from("b1");
        f.pool.ask("hi", &b1).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        f.store.set_fail_writes(true);
        let report = f.pool.sweep().await;
        assert_eq!(report.evicted, vec![b1.clone()]);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.pool.pending_withdrawals(), vec![b1.clone()]);
        assert!(f.store.contains("BOT-b1"));

        f.store.set_fail_writes(false);
        let report = f.pool.sweep().await;
        assert_eq!(report.withdrawn, 1);
        assert!(f.pool.pending_withdrawals().is_empty());
        assert!(!f.store.contains("BOT-b1"));
        assert_eq!(f.pool.stats().eviction_failures, 1);
    }

    #[tokio::test]
    async fn test_shutdown_withdraws_everything() {
        let f = fixture();
        f.pool.ask("hi", &"b1".into()).await.unwrap();
        f.pool.ask("hi", &"b2".into()).await.unwrap();

        assert_eq!(f.pool.shutdown().await, 2);
        assert_eq!(f.pool.entry_count().await, 0);
        assert!(f
            .pool
            .directory()
            .bots_on("10.0.0.1")
            .await
            .unwrap()
            .is_empty());
        assert!(!f.store.contains("BOT-b1"));
        assert!(!f.store.contains("BOT-b2"));
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let f = fixture();
        f.pool.ask("hi", &"b2".into()).await.unwrap();
        f.pool.ask("hi", &"b1".into()).await.unwrap();

        let status = f.pool.status();
        assert_eq!(status.server_addr, "10.0.0.1");
        let ids: Vec<&str> = status.entries.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
        assert!(status.entries.iter().all(|e| e.running && e.in_flight == 0));
        assert_eq!(status.stats.spawns, 2);
    }
}
