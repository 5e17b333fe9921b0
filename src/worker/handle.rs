//! Handle to a running worker
//!
//! A driver task owns the worker's pipes (and its child process, when there
//! is one). Callers hand it an [`Exchange`]: the question plus a one-shot
//! sender for the answer. The driver runs one exchange at a time, so
//! concurrent asks for the same bot are queued rather than interleaved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{write_message, ManagerMessage, MessageReader, WorkerMessage};
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};

/// Exchanges buffered ahead of the one in progress
const EXCHANGE_BUFFER: usize = 1;

/// How long a worker gets to exit after `shutdown` before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One question travelling to the driver, with the slot for its answer
struct Exchange {
    question: String,
    reply: oneshot::Sender<Result<String>>,
}

/// Handle to one running worker
pub struct WorkerHandle {
    worker_id: Uuid,
    identity: BotIdentity,
    pid: Option<u32>,
    requests: mpsc::Sender<Exchange>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    exited: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Load the definition into a freshly started worker and start driving it.
    ///
    /// Waits for the worker's `ready`, bounded by `startup_timeout` when set.
    /// On failure the child (if any) is dropped, which kills it.
    pub async fn start<R, W>(
        identity: BotIdentity,
        definition: &BotDefinition,
        reader: R,
        mut writer: W,
        child: Option<Child>,
        startup_timeout: Option<Duration>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let worker_id = Uuid::new_v4();
        let pid = child.as_ref().and_then(|c| c.id());
        let mut reader = MessageReader::new(reader);

        let load = ManagerMessage::Load {
            identity: identity.clone(),
            definition: definition.as_bytes().to_vec(),
        };
        write_message(&mut writer, &load)
            .await
            .map_err(|e| PoolError::WorkerSpawn(format!("failed to send definition: {}", e)))?;

        let handshake = wait_ready(&mut reader);
        match startup_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake).await.map_err(|_| {
                PoolError::WorkerSpawn(format!("worker for {} not ready within {:?}", identity, limit))
            })??,
            None => handshake.await?,
        }

        let (requests_tx, requests_rx) = mpsc::channel(EXCHANGE_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        let driver = tokio::spawn(drive(
            identity.clone(),
            reader,
            writer,
            requests_rx,
            shutdown_rx,
            child,
            Arc::clone(&exited),
        ));

        info!(
            identity = %identity,
            worker_id = %worker_id,
            pid = pid.unwrap_or(0),
            "Worker ready"
        );

        Ok(Self {
            worker_id,
            identity,
            pid,
            requests: requests_tx,
            shutdown: Mutex::new(Some(shutdown_tx)),
            driver: Mutex::new(Some(driver)),
            exited,
        })
    }

    /// Unique id of this worker instance (a respawned bot gets a new one)
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    /// OS process id, when backed by a process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the driver is still serving requests
    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Send a question and wait for its answer.
    ///
    /// `timeout` covers queueing behind earlier questions as well as the
    /// worker's own think time.
    pub async fn ask(&self, question: String, timeout: Option<Duration>) -> Result<String> {
        let round_trip = async {
            let (reply, answer) = oneshot::channel();
            self.requests
                .send(Exchange { question, reply })
                .await
                .map_err(|_| PoolError::WorkerCrash(format!("worker for {} is not running", self.identity)))?;
            answer.await.map_err(|_| {
                PoolError::WorkerCrash(format!("worker for {} exited before answering", self.identity))
            })?
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, round_trip).await.map_err(|_| {
                PoolError::WorkerTimeout(format!("no answer from {} within {:?}", self.identity, limit))
            })?,
            None => round_trip.await,
        }
    }

    /// Stop the worker and wait for the driver to finish.
    ///
    /// Safe to call more than once.
    pub async fn terminate(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.await {
                warn!(identity = %self.identity, "Worker driver ended abnormally: {}", e);
            }
        }
    }
}

/// Wait for `ready`, failing on `failed` or a closed stream
async fn wait_ready<R: AsyncRead + Unpin>(reader: &mut MessageReader<R>) -> Result<()> {
    loop {
        match reader.next::<WorkerMessage>().await {
            Ok(Some(WorkerMessage::Ready)) => return Ok(()),
            Ok(Some(WorkerMessage::Failed { error, .. })) => {
                return Err(PoolError::WorkerSpawn(format!("worker rejected definition: {}", error)))
            }
            Ok(Some(other)) => debug!(?other, "Ignoring message before ready"),
            Ok(None) => {
                return Err(PoolError::WorkerSpawn("worker exited during startup".into()))
            }
            Err(e) => return Err(PoolError::WorkerSpawn(format!("reading worker output: {}", e))),
        }
    }
}

/// Send one question and read until its answer arrives
async fn round_trip<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut W,
    seq: u64,
    question: String,
) -> Result<String>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_message(writer, &ManagerMessage::Question { seq, text: question })
        .await
        .map_err(|e| PoolError::WorkerCrash(format!("failed to send question: {}", e)))?;

    loop {
        let message = reader
            .next::<WorkerMessage>()
            .await
            .map_err(|e| PoolError::WorkerCrash(format!("reading worker output: {}", e)))?;

        match message {
            None => return Err(PoolError::WorkerCrash("worker closed its output".into())),
            Some(WorkerMessage::Answer { seq: s, text }) if s == seq => return Ok(text),
            Some(WorkerMessage::Failed { seq: Some(s), error }) if s == seq => {
                return Err(PoolError::Protocol(format!("worker could not answer: {}", error)))
            }
            Some(WorkerMessage::Failed { seq: None, error }) => {
                return Err(PoolError::WorkerCrash(error))
            }
            Some(other) => debug!(?other, seq, "Discarding stale worker message"),
        }
    }
}

/// Driver loop: one exchange at a time until shutdown, handle drop or crash
async fn drive<R, W>(
    identity: BotIdentity,
    mut reader: MessageReader<R>,
    mut writer: W,
    mut requests: mpsc::Receiver<Exchange>,
    mut shutdown: oneshot::Receiver<()>,
    child: Option<Child>,
    exited: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut seq = 0u64;

    loop {
        let exchange = tokio::select! {
            _ = &mut shutdown => break,
            next = requests.recv() => match next {
                Some(exchange) => exchange,
                None => break,
            },
        };

        seq += 1;
        let Exchange { question, reply } = exchange;

        let outcome = tokio::select! {
            _ = &mut shutdown => {
                let _ = reply.send(Err(PoolError::WorkerCrash(
                    "worker terminated while answering".into(),
                )));
                break;
            }
            result = round_trip(&mut reader, &mut writer, seq, question) => result,
        };

        let crashed = matches!(outcome, Err(PoolError::WorkerCrash(_)));
        if let Err(e) = &outcome {
            warn!(identity = %identity, seq, "Question failed: {}", e);
        }
        let _ = reply.send(outcome);

        if crashed {
            break;
        }
    }

    exited.store(true, Ordering::SeqCst);
    requests.close();

    // Best effort: a crashed worker has no stdin left to read this
    let _ = write_message(&mut writer, &ManagerMessage::Shutdown).await;
    drop(writer);

    if let Some(child) = child {
        reap(&identity, child).await;
    }

    debug!(identity = %identity, "Worker driver stopped");
}

/// Give the process a moment to exit on its own, then kill it
async fn reap(identity: &BotIdentity, mut child: Child) {
    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(identity = %identity, %status, "Worker process exited"),
        Ok(Err(e)) => warn!(identity = %identity, "Failed to wait for worker process: {}", e),
        Err(_) => {
            warn!(identity = %identity, "Worker ignored shutdown, killing it");
            if let Err(e) = child.kill().await {
                warn!(identity = %identity, "Failed to kill worker process: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    type FakeReader = MessageReader<ReadHalf<DuplexStream>>;
    type FakeWriter = WriteHalf<DuplexStream>;

    /// Worker side of a duplex pipe, driven by hand
    async fn start_with_fake() -> (tokio::task::JoinHandle<Result<WorkerHandle>>, FakeReader, FakeWriter) {
        let (manager_side, worker_side) = duplex(4096);
        let (manager_read, manager_write) = split(manager_side);
        let (worker_read, worker_write) = split(worker_side);

        let handle = tokio::spawn(async move {
            WorkerHandle::start(
                "b1".into(),
                &BotDefinition::new(b"D1".to_vec()),
                manager_read,
                manager_write,
                None,
                Some(Duration::from_secs(5)),
            )
            .await
        });

        (handle, MessageReader::new(worker_read), worker_write)
    }

    #[tokio::test]
    async fn test_load_ready_and_answer() {
        let (start, mut from_manager, mut to_manager) = start_with_fake().await;

        let load = from_manager.next::<ManagerMessage>().await.unwrap().unwrap();
        assert_eq!(
            load,
            ManagerMessage::Load {
                identity: "b1".into(),
                definition: b"D1".to_vec()
            }
        );
        write_message(&mut to_manager, &WorkerMessage::Ready).await.unwrap();
        let handle = start.await.unwrap().unwrap();
        assert!(handle.is_running());

        let worker = tokio::spawn(async move {
            let question = from_manager.next::<ManagerMessage>().await.unwrap().unwrap();
            assert_eq!(
                question,
                ManagerMessage::Question {
                    seq: 1,
                    text: "hi".into()
                }
            );
            write_message(
                &mut to_manager,
                &WorkerMessage::Answer {
                    seq: 1,
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
            (from_manager, to_manager)
        });

        assert_eq!(handle.ask("hi".into(), None).await.unwrap(), "hello");
        let _pipes = worker.await.unwrap();
        handle.terminate().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_rejected_definition_fails_start() {
        let (start, mut from_manager, mut to_manager) = start_with_fake().await;
        let _load = from_manager.next::<ManagerMessage>().await.unwrap();
        write_message(
            &mut to_manager,
            &WorkerMessage::Failed {
                seq: None,
                error: "corrupt model".into(),
            },
        )
        .await
        .unwrap();

        let err = start.await.unwrap().err().unwrap();
        assert!(matches!(err, PoolError::WorkerSpawn(msg) if msg.contains("corrupt model")));
    }

    #[tokio::test]
    async fn test_closed_output_is_a_crash() {
        let (start, mut from_manager, mut to_manager) = start_with_fake().await;
        let _load = from_manager.next::<ManagerMessage>().await.unwrap();
        write_message(&mut to_manager, &WorkerMessage::Ready).await.unwrap();
        let handle = start.await.unwrap().unwrap();

        to_manager.shutdown().await.unwrap();
        let err = handle.ask("hi".into(), None).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerCrash(_)));

        // The driver has stopped; later asks fail fast
        let err = handle.ask("again".into(), None).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerCrash(_)));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_binary_output_is_not_a_crash() {
        let (start, mut from_manager, mut to_manager) = start_with_fake().await;
        let _load = from_manager.next::<ManagerMessage>().await.unwrap();
        to_manager.write_all(b"\xff\xfe warming up\n").await.unwrap();
        write_message(&mut to_manager, &WorkerMessage::Ready).await.unwrap();
        let handle = start.await.unwrap().unwrap();

        let worker = tokio::spawn(async move {
            let _question = from_manager.next::<ManagerMessage>().await.unwrap().unwrap();
            to_manager.write_all(b"\x80\x81\x82\n").await.unwrap();
            write_message(
                &mut to_manager,
                &WorkerMessage::Answer {
                    seq: 1,
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
            (from_manager, to_manager)
        });

        assert_eq!(handle.ask("hi".into(), None).await.unwrap(), "hello");
        let _pipes = worker.await.unwrap();
        assert!(handle.is_running());
        handle.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_times_out() {
        let (start, mut from_manager, mut to_manager) = start_with_fake().await;
        let _load = from_manager.next::<ManagerMessage>().await.unwrap();
        write_message(&mut to_manager, &WorkerMessage::Ready).await.unwrap();
        let handle = start.await.unwrap().unwrap();

        let err = handle
            .ask("hi".into(), Some(Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::WorkerTimeout(_)));
        handle.terminate().await;
    }
}
