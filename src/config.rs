//! Configuration for botpool
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::PoolError;

/// Default metadata endpoint that reports this instance's private address
pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/private-ipv4";

/// botpool - per-bot worker process pool
#[derive(Parser, Debug, Clone)]
#[command(name = "botpool")]
#[command(about = "Bot instance pool manager with a shared placement directory")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8888")]
    pub listen: SocketAddr,

    /// Address other instances know us by (skips the metadata lookup)
    #[arg(long, env = "ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Metadata endpoint queried for our address when ADVERTISE_ADDR is unset
    #[arg(long, env = "METADATA_URL", default_value = DEFAULT_METADATA_URL)]
    pub metadata_url: String,

    /// Enable development mode (in-memory directory and backend when stores are unreachable)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "bothub")]
    pub mongodb_db: String,

    /// Collection holding bot definitions
    #[arg(long, env = "MONGODB_BOTS_COLLECTION", default_value = "bots")]
    pub mongodb_bots_collection: String,

    /// Worker executable spawned once per bot
    #[arg(long, env = "WORKER_BIN", default_value = "bot-worker")]
    pub worker_bin: PathBuf,

    /// Extra arguments passed to every worker (comma-separated)
    #[arg(long, env = "WORKER_ARGS", value_delimiter = ',', allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Seconds between garbage collection sweeps
    #[arg(long, env = "GC_INTERVAL_SECS", default_value = "300")]
    pub gc_interval_secs: u64,

    /// Seconds of inactivity after which a worker is evicted
    #[arg(long, env = "IDLE_THRESHOLD_SECS", default_value = "300")]
    pub idle_threshold_secs: u64,

    /// Maximum wait for an answer in milliseconds (unset = wait until the worker answers or exits)
    #[arg(long, env = "ASK_TIMEOUT_MS")]
    pub ask_timeout_ms: Option<u64>,

    /// Maximum wait for a new worker to report ready in milliseconds (unset = unbounded)
    #[arg(long, env = "WORKER_STARTUP_TIMEOUT_MS")]
    pub worker_startup_timeout_ms: Option<u64>,

    /// Attempts for directory and backend calls before giving up
    #[arg(long, env = "STORE_RETRY_ATTEMPTS", default_value = "3")]
    pub store_retry_attempts: u32,

    /// Initial backoff between store retries in milliseconds (doubles per attempt)
    #[arg(long, env = "STORE_RETRY_BASE_MS", default_value = "100")]
    pub store_retry_base_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// JetStream key/value bucket used as the placement directory
    #[arg(long, env = "NATS_KV_BUCKET", default_value = "botpool")]
    pub kv_bucket: String,
}

impl Args {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn ask_timeout(&self) -> Option<Duration> {
        self.ask_timeout_ms.map(Duration::from_millis)
    }

    pub fn worker_startup_timeout(&self) -> Option<Duration> {
        self.worker_startup_timeout_ms.map(Duration::from_millis)
    }

    pub fn store_retry_base(&self) -> Duration {
        Duration::from_millis(self.store_retry_base_ms)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.gc_interval_secs == 0 {
            return Err(PoolError::Config("GC_INTERVAL_SECS must be greater than 0".into()));
        }
        if self.idle_threshold_secs == 0 {
            return Err(PoolError::Config("IDLE_THRESHOLD_SECS must be greater than 0".into()));
        }
        if self.ask_timeout_ms == Some(0) {
            return Err(PoolError::Config("ASK_TIMEOUT_MS must be greater than 0 when set".into()));
        }
        if self.worker_startup_timeout_ms == Some(0) {
            return Err(PoolError::Config(
                "WORKER_STARTUP_TIMEOUT_MS must be greater than 0 when set".into(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(PoolError::Config("STORE_RETRY_ATTEMPTS must be at least 1".into()));
        }
        if self.nats.kv_bucket.is_empty() {
            return Err(PoolError::Config("NATS_KV_BUCKET must not be empty".into()));
        }
        if !matches!(self.log_format.to_ascii_lowercase().as_str(), "text" | "json") {
            return Err(PoolError::Config(format!(
                "LOG_FORMAT must be 'text' or 'json', got '{}'",
                self.log_format
            )));
        }
        if let Some(addr) = &self.advertise_addr {
            if addr.trim().is_empty() {
                return Err(PoolError::Config("ADVERTISE_ADDR must not be blank".into()));
            }
        }
        Ok(())
    }
}
