//! botpool - bot instance pool manager
//!
//! Answers questions for many bots by keeping one worker process per bot,
//! started on first use and stopped once it has been idle for a while.
//! Placement is recorded in a directory shared by every instance.
//!
//! ## Components
//!
//! - **Pool**: identity → worker resolution, the ask handshake, idle eviction
//! - **Directory**: `<id>` definition cache, `BOT-<id>` owner pointers and
//!   `SERVER-<addr>` owned sets in a NATS key/value bucket
//! - **Backend**: bot definitions in MongoDB
//! - **Worker**: line-delimited JSON protocol, process and in-task spawners
//! - **Server**: `GET /bots?uuid=&msg=` plus health and status

pub mod address;
pub mod backend;
pub mod config;
pub mod directory;
pub mod logging;
pub mod pool;
pub mod retry;
pub mod server;
pub mod types;
pub mod worker;

pub use config::Args;
pub use pool::{GarbageCollector, PoolConfig, PoolManager};
pub use server::{run, AppState};
pub use types::{BotDefinition, BotIdentity, PoolError, Result};
