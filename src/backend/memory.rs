//! In-memory backend store for tests and development mode

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::BackendStore;
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};

#[derive(Default)]
pub struct MemoryBackend {
    definitions: DashMap<BotIdentity, BotDefinition>,
    fetches: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: impl Into<BotIdentity>, definition: BotDefinition) {
        self.definitions.insert(identity.into(), definition);
    }

    /// Number of fetches served, found or not
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BackendStore for MemoryBackend {
    async fn fetch_definition(&self, identity: &BotIdentity) -> Result<BotDefinition> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.definitions
            .get(identity)
            .map(|d| d.value().clone())
            .ok_or_else(|| PoolError::DefinitionNotFound(identity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_known_and_unknown() {
        let backend = MemoryBackend::new();
        backend.insert("b1", BotDefinition::new(b"D1".to_vec()));

        let def = backend.fetch_definition(&"b1".into()).await.unwrap();
        assert_eq!(def.as_bytes(), b"D1");

        let err = backend.fetch_definition(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, PoolError::DefinitionNotFound(id) if id == "nope"));
        assert_eq!(backend.fetch_count(), 2);
    }
}
