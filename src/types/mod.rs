//! Shared types

pub mod error;
pub mod identity;

pub use error::{PoolError, Result};
pub use identity::{BotDefinition, BotIdentity};
