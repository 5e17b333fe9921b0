//! Background garbage collector
//!
//! Runs [`PoolManager::sweep`] on a fixed interval. The first sweep happens
//! one full interval after start.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::manager::PoolManager;

pub struct GarbageCollector {
    pool: Arc<PoolManager>,
    interval: Duration,
    /// Whether the collector is running
    running: Arc<RwLock<bool>>,
    stop: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        let interval = pool.config().gc_interval;
        Self {
            pool,
            interval,
            running: Arc::new(RwLock::new(false)),
            stop: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Start the sweep loop
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Garbage collector already running");
                return;
            }
            *running = true;
        }

        info!(
            interval_secs = self.interval.as_secs(),
            idle_threshold_secs = self.pool.config().idle_threshold.as_secs(),
            "Starting garbage collector"
        );

        let pool = Arc::clone(&self.pool);
        let running = Arc::clone(&self.running);
        let stop = Arc::clone(&self.stop);
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.notified() => break,
                }

                if !*running.read().await {
                    break;
                }

                // A sweep never fails as a whole; per-entry errors are logged inside
                let report = pool.sweep().await;
                debug!(evicted = report.evicted.len(), "Sweep complete");
            }

            info!("Garbage collector stopped");
        });

        *self.task.lock().await = Some(task);
    }

    /// Stop the loop, waiting for a sweep in progress to finish
    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.stop.notify_one();

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Garbage collector task ended abnormally: {}", e);
            }
        }
    }

    /// Check if the collector is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::directory::{Directory, MemoryDirectory};
    use crate::pool::PoolConfig;
    use crate::retry::RetryPolicy;
    use crate::types::{BotDefinition, BotIdentity};
    use crate::worker::{Responder, TaskSpawner};

    struct Fixed;

    impl Responder for Fixed {
        fn respond(&mut self, _question: &str) -> std::result::Result<String, String> {
            Ok("ok".into())
        }
    }

    fn pool(store: Arc<MemoryDirectory>) -> Arc<PoolManager> {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("b1", BotDefinition::new(b"D1".to_vec()));
        Arc::new(PoolManager::new(
            PoolConfig {
                gc_interval: Duration::from_secs(60),
                idle_threshold: Duration::from_secs(120),
                ..PoolConfig::default()
            },
            Directory::new(store, "10.0.0.1", RetryPolicy::none()),
            backend,
            Arc::new(TaskSpawner::new(|_, _| Ok(Box::new(Fixed) as Box<dyn Responder>))),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_evicts_on_schedule() {
        let store = Arc::new(MemoryDirectory::new());
        let pool = pool(store.clone());
        let b1 = BotIdentity::from("b1");
        pool.ask("hi", &b1).await.unwrap();

        let gc = GarbageCollector::new(Arc::clone(&pool));
        gc.start().await;
        assert!(gc.is_running().await);

        // Sweeps at 60s and 120s; only the second sees the entry as idle
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(pool.entry(&b1).await.is_some());

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(pool.entry(&b1).await.is_none());
        assert!(!store.contains("BOT-b1"));

        gc.stop().await;
        assert!(!gc.is_running().await);
        assert!(pool.stats().sweeps >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_sweep() {
        let pool = pool(Arc::new(MemoryDirectory::new()));
        let gc = GarbageCollector::new(Arc::clone(&pool));
        gc.start().await;
        gc.start().await;
        gc.stop().await;
        assert_eq!(pool.stats().sweeps, 0);
    }
}
