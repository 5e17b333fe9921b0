//! In-memory directory store
//!
//! Used in development mode and by tests. Set updates run under the map's
//! shard lock, so they are atomic like the CAS loop of the NATS store.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{DirectoryStore, SetOp};
use crate::types::{PoolError, Result};

/// DashMap-backed directory store
#[derive(Default)]
pub struct MemoryDirectory {
    entries: DashMap<String, Bytes>,
    /// When set, every write is rejected as unacknowledged
    fail_writes: AtomicBool,
    /// Total acknowledged writes
    writes: AtomicU64,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Snapshot of every key currently stored
    pub fn keys(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn check_write(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PoolError::DirectoryWrite(format!(
                "write to '{}' not acknowledged",
                key
            )));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectory {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.check_write(key)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_write(key)?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.check_write(key)?;
        Ok(self
            .entries
            .remove_if(key, |_, current| current.as_ref() == expected)
            .is_some())
    }

    async fn swap(&self, key: &str, value: Bytes) -> Result<Option<Bytes>> {
        self.check_write(key)?;
        Ok(self.entries.insert(key.to_string(), value))
    }

    async fn update_set(&self, key: &str, op: SetOp) -> Result<()> {
        self.check_write(key)?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let updated = op.apply_to(Some(entry.get().as_ref()))?;
                entry.insert(updated);
            }
            Entry::Vacant(entry) => {
                entry.insert(op.apply_to(None)?);
            }
        }
        Ok(())
    }
}
