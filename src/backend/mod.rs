//! Backend store holding the authoritative bot definitions
//!
//! The pool only reads from it, on a cold start for an identity that is not
//! in the directory's definition cache.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;

use crate::types::{BotDefinition, BotIdentity, Result};

pub use memory::MemoryBackend;
pub use mongo::MongoBackend;

/// Source of bot definitions
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Fetch the definition for `identity`.
    ///
    /// Fails with `PoolError::DefinitionNotFound` when the bot is unknown.
    async fn fetch_definition(&self, identity: &BotIdentity) -> Result<BotDefinition>;
}
