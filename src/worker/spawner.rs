//! Worker construction
//!
//! [`ProcessSpawner`] runs every bot in its own OS process, which is what
//! production uses: a misbehaving bot can only take down itself.
//! [`TaskSpawner`] runs the same protocol over in-memory pipes inside this
//! process, for tests and embedding.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::handle::WorkerHandle;
use super::runtime::{serve, Responder};
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};

/// Capacity of each in-memory pipe used by [`TaskSpawner`]
const PIPE_CAPACITY: usize = 64 * 1024;

/// Produces a running worker for a bot definition
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, identity: &BotIdentity, definition: &BotDefinition) -> Result<WorkerHandle>;
}

/// Spawns one child process per bot
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    startup_timeout: Option<Duration>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            startup_timeout: None,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, identity: &BotIdentity, definition: &BotDefinition) -> Result<WorkerHandle> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("BOT_IDENTITY", identity.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker logs flow to our stderr
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PoolError::WorkerSpawn(format!(
                "failed to spawn {} for {}: {}",
                self.program.display(),
                identity,
                e
            ))
        })?;

        debug!(
            identity = %identity,
            pid = child.id().unwrap_or(0),
            program = %self.program.display(),
            "Spawned worker process"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::WorkerSpawn("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::WorkerSpawn("failed to capture worker stdout".into()))?;

        WorkerHandle::start(
            identity.clone(),
            definition,
            stdout,
            stdin,
            Some(child),
            self.startup_timeout,
        )
        .await
    }
}

/// Builds the bot logic for an in-process worker
pub type ResponderFactory = dyn Fn(&BotIdentity, &BotDefinition) -> std::result::Result<Box<dyn Responder>, String>
    + Send
    + Sync;

/// Spawns workers as tasks connected through in-memory pipes
pub struct TaskSpawner {
    factory: Arc<ResponderFactory>,
    spawned: AtomicUsize,
    startup_timeout: Option<Duration>,
}

impl TaskSpawner {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&BotIdentity, &BotDefinition) -> std::result::Result<Box<dyn Responder>, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            factory: Arc::new(factory),
            spawned: AtomicUsize::new(0),
            startup_timeout: None,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Number of workers started so far
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerSpawner for TaskSpawner {
    async fn spawn(&self, identity: &BotIdentity, definition: &BotDefinition) -> Result<WorkerHandle> {
        let (manager_side, worker_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let (manager_read, manager_write) = tokio::io::split(manager_side);

        let factory = Arc::clone(&self.factory);
        let task_identity = identity.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(worker_read, worker_write, |id, def| factory(id, def)).await {
                warn!(identity = %task_identity, "In-process worker stopped: {}", e);
            }
        });

        self.spawned.fetch_add(1, Ordering::SeqCst);

        WorkerHandle::start(
            identity.clone(),
            definition,
            manager_read,
            manager_write,
            None,
            self.startup_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::KeywordResponder;

    fn keyword_spawner() -> TaskSpawner {
        TaskSpawner::new(|_, def| {
            KeywordResponder::from_definition(def).map(|r| Box::new(r) as Box<dyn Responder>)
        })
    }

    #[tokio::test]
    async fn test_task_spawner_round_trip() {
        let spawner = keyword_spawner();
        let def = BotDefinition::new(
            br#"{"intents":[{"keywords":["hi"],"answer":"hello"}]}"#.to_vec(),
        );

        let worker = spawner.spawn(&"b1".into(), &def).await.unwrap();
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(worker.pid(), None);
        assert_eq!(worker.ask("hi".into(), None).await.unwrap(), "hello");

        worker.terminate().await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_task_spawner_rejects_bad_definition() {
        let spawner = keyword_spawner();
        let err = spawner
            .spawn(&"b1".into(), &BotDefinition::new(b"not json".to_vec()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::WorkerSpawn(_)));
    }

    #[tokio::test]
    async fn test_process_spawner_missing_binary() {
        let spawner = ProcessSpawner::new("/nonexistent/bot-worker", vec![]);
        let err = spawner
            .spawn(&"b1".into(), &BotDefinition::new(b"{}".to_vec()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::WorkerSpawn(msg) if msg.contains("/nonexistent/bot-worker")));
    }
}
