//! NATS JetStream key/value directory store
//!
//! Set updates, pointer swaps and conditional deletes are revision-checked
//! writes, so concurrent instances touching the same key never lose an
//! update. The two-key publish (pointer + set) is still not transactional.

use async_nats::jetstream::{self, kv};
use async_nats::ConnectOptions;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

use super::{DirectoryStore, SetOp};
use crate::config::NatsArgs;
use crate::types::{PoolError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Revision conflicts tolerated before a set update is reported as failed
const CAS_ATTEMPTS: usize = 8;

/// Directory store on a JetStream KV bucket
pub struct NatsDirectory {
    kv: kv::Store,
    bucket: String,
}

impl NatsDirectory {
    /// Connect to NATS and open (or create) the directory bucket
    pub async fn connect(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| PoolError::Directory(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Self::open(client, &args.kv_bucket).await
    }

    /// Open the bucket on an existing connection, creating it on first use
    pub async fn open(client: async_nats::Client, bucket: &str) -> Result<Self> {
        let js = jetstream::new(client);

        let kv = match js.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(e) => {
                debug!("KV bucket '{}' not found ({}), creating it", bucket, e);
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    description: "botpool placement directory".to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    PoolError::Directory(format!("Failed to create KV bucket '{}': {}", bucket, e))
                })?
            }
        };

        info!("Directory bucket '{}' ready", bucket);

        Ok(Self {
            kv,
            bucket: bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Map a directory key onto the KV key alphabet (`[-/_=.A-Za-z0-9]`).
///
/// Characters outside it (e.g. the `:` of `host:port`) become `_`.
pub fn kv_key(key: &str) -> String {
    let mapped: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_matches('.').to_string()
}

#[async_trait]
impl DirectoryStore for NatsDirectory {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.kv
            .get(kv_key(key))
            .await
            .map_err(|e| PoolError::Directory(format!("get {}: {}", key, e)))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.kv
            .put(kv_key(key), value)
            .await
            .map(|_| ())
            .map_err(|e| PoolError::DirectoryWrite(format!("put {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv
            .delete(kv_key(key))
            .await
            .map_err(|e| PoolError::DirectoryWrite(format!("delete {}: {}", key, e)))
    }

    async fn swap(&self, key: &str, value: Bytes) -> Result<Option<Bytes>> {
        let kv_key = kv_key(key);
        let mut last_error = String::new();

        for attempt in 1..=CAS_ATTEMPTS {
            let (previous, revision) = self.current(key, &kv_key).await?;
            match self.write_at(&kv_key, value.clone(), revision).await {
                Ok(()) => return Ok(previous),
                Err(e) => {
                    debug!(attempt, "Swap on {} lost a race: {}", key, e);
                    last_error = e;
                }
            }
        }

        Err(PoolError::DirectoryWrite(format!(
            "swap {} gave up after {} attempts: {}",
            key, CAS_ATTEMPTS, last_error
        )))
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let kv_key = kv_key(key);
        let mut last_error = String::new();

        for attempt in 1..=CAS_ATTEMPTS {
            let (current, revision) = self.current(key, &kv_key).await?;
            if current.as_deref() != Some(expected) {
                return Ok(false);
            }
            match self.kv.delete_expect_revision(&kv_key, revision).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    debug!(attempt, "Conditional delete of {} lost a race: {}", key, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(PoolError::DirectoryWrite(format!(
            "delete {} gave up after {} attempts: {}",
            key, CAS_ATTEMPTS, last_error
        )))
    }

    async fn update_set(&self, key: &str, op: SetOp) -> Result<()> {
        let kv_key = kv_key(key);
        let mut last_error = String::new();

        for attempt in 1..=CAS_ATTEMPTS {
            let (current, revision) = self.current(key, &kv_key).await?;
            let value = op.apply_to(current.as_deref())?;

            match self.write_at(&kv_key, value, revision).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(attempt, "Set update on {} lost a race: {}", key, e);
                    last_error = e;
                }
            }
        }

        Err(PoolError::DirectoryWrite(format!(
            "update {} gave up after {} attempts: {}",
            key, CAS_ATTEMPTS, last_error
        )))
    }
}

impl NatsDirectory {
    /// Live value of a key and the revision to build the next write on.
    ///
    /// Delete/purge markers have no value but still carry a revision.
    async fn current(&self, key: &str, kv_key: &str) -> Result<(Option<Bytes>, Option<u64>)> {
        let entry = self
            .kv
            .entry(kv_key)
            .await
            .map_err(|e| PoolError::Directory(format!("entry {}: {}", key, e)))?;

        Ok(match entry {
            Some(e) if matches!(e.operation, kv::Operation::Put) => (Some(e.value), Some(e.revision)),
            Some(e) => (None, Some(e.revision)),
            None => (None, None),
        })
    }

    /// Write only if the key is still at `revision` (or still absent)
    async fn write_at(&self, kv_key: &str, value: Bytes, revision: Option<u64>) -> std::result::Result<(), String> {
        match revision {
            Some(rev) => self
                .kv
                .update(kv_key, value, rev)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => self
                .kv
                .create(kv_key, value)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        }
    }
}
