//! Placement directory shared by every botpool instance
//!
//! Three kinds of records live in one flat key space:
//!
//! - `<identity>` → cached bot definition (never deleted here)
//! - `BOT-<identity>` → address of the server running a worker for it
//! - `SERVER-<address>` → set of identities that server is running
//!
//! The directory is bookkeeping, not a lock. Two instances may both run a
//! worker for the same bot; the pointer then reflects the last writer and
//! the previous owner's set is corrected on publish.

pub mod adapter;
pub mod memory;
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;

use crate::types::{BotIdentity, PoolError, Result};

pub use adapter::Directory;
pub use memory::MemoryDirectory;
pub use nats::NatsDirectory;

/// Key namespace for directory records
pub struct DirectoryKeys;

impl DirectoryKeys {
    /// Definition cache key
    pub fn definition(identity: &BotIdentity) -> String {
        identity.as_str().to_string()
    }

    /// bot→server pointer key
    pub fn owner(identity: &BotIdentity) -> String {
        format!("BOT-{}", identity)
    }

    /// server→bots set key
    pub fn server(address: &str) -> String {
        format!("SERVER-{}", address)
    }
}

/// Mutation applied to a set-valued record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOp {
    Insert(String),
    Remove(String),
    Clear,
}

impl SetOp {
    pub fn apply(&self, set: &mut BTreeSet<String>) {
        match self {
            SetOp::Insert(member) => {
                set.insert(member.clone());
            }
            SetOp::Remove(member) => {
                set.remove(member);
            }
            SetOp::Clear => set.clear(),
        }
    }

    /// New encoded value for a record currently holding `current`.
    ///
    /// `Clear` never looks at the old value, so it also repairs a record
    /// that does not decode.
    pub fn apply_to(&self, current: Option<&[u8]>) -> Result<Bytes> {
        let mut set = match (self, current) {
            (SetOp::Clear, _) | (_, None) => BTreeSet::new(),
            (_, Some(raw)) => decode_set(raw)?,
        };
        self.apply(&mut set);
        Ok(encode_set(&set))
    }
}

/// Key/value store backing the directory.
///
/// Every operation is idempotent. Set mutations must be atomic with respect
/// to other writers of the same key.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Remove a key. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete `key` only while it still holds `expected`. Returns whether it was deleted.
    ///
    /// The default is a plain read-then-delete and races with concurrent writers.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        match self.get(key).await? {
            Some(current) if current.as_ref() == expected => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Write `value` and return what the key held before.
    ///
    /// The default is a plain read-then-write; stores that can should make
    /// the exchange atomic so concurrent writers each see the value they replaced.
    async fn swap(&self, key: &str, value: Bytes) -> Result<Option<Bytes>> {
        let previous = self.get(key).await?;
        self.set(key, value).await?;
        Ok(previous)
    }

    /// Read a set-valued record; a missing key is the empty set
    async fn members(&self, key: &str) -> Result<BTreeSet<String>> {
        match self.get(key).await? {
            Some(raw) => decode_set(&raw),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn update_set(&self, key: &str, op: SetOp) -> Result<()>;
}

/// Encode a set record as a JSON array
pub fn encode_set(set: &BTreeSet<String>) -> Bytes {
    // A BTreeSet<String> always serializes
    Bytes::from(serde_json::to_vec(set).unwrap_or_else(|_| b"[]".to_vec()))
}

/// Decode a set record; an empty value is the empty set
pub fn decode_set(raw: &[u8]) -> Result<BTreeSet<String>> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(BTreeSet::new());
    }
    serde_json::from_slice(raw)
        .map_err(|e| PoolError::MalformedRecord(format!("set record: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespaces() {
        let id = BotIdentity::from("3f2a");
        assert_eq!(DirectoryKeys::definition(&id), "3f2a");
        assert_eq!(DirectoryKeys::owner(&id), "BOT-3f2a");
        assert_eq!(DirectoryKeys::server("10.0.0.7"), "SERVER-10.0.0.7");
    }

    #[test]
    fn test_set_ops() {
        let mut set = BTreeSet::new();
        SetOp::Insert("b1".into()).apply(&mut set);
        SetOp::Insert("b2".into()).apply(&mut set);
        SetOp::Insert("b1".into()).apply(&mut set);
        assert_eq!(set.len(), 2);

        SetOp::Remove("b1".into()).apply(&mut set);
        SetOp::Remove("missing".into()).apply(&mut set);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["b2".to_string()]);
    }

    #[test]
    fn test_set_encoding() {
        let set: BTreeSet<String> = ["b2", "b1"].iter().map(|s| s.to_string()).collect();
        let raw = encode_set(&set);
        assert_eq!(raw.as_ref(), br#"["b1","b2"]"#);
        assert_eq!(decode_set(&raw).unwrap(), set);
    }

    #[test]
    fn test_blank_set_record_is_empty() {
        assert!(decode_set(b"").unwrap().is_empty());
        assert!(decode_set(b"  ").unwrap().is_empty());
        assert!(matches!(
            decode_set(b"BOT-1 BOT-2"),
            Err(PoolError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_clear_overwrites_undecodable_record() {
        let cleared = SetOp::Clear.apply_to(Some(b"BOT-a BOT-b")).unwrap();
        assert_eq!(cleared.as_ref(), b"[]");

        let err = SetOp::Insert("b1".into())
            .apply_to(Some(b"BOT-a BOT-b"))
            .unwrap_err();
        assert!(!err.is_transient());

        let inserted = SetOp::Insert("b1".into()).apply_to(None).unwrap();
        assert_eq!(inserted.as_ref(), br#"["b1"]"#);
    }
}
