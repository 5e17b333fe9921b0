//! Per-bot workers
//!
//! Every resolved bot runs in its own worker. The pool only ever talks to a
//! [`WorkerHandle`]; how the worker is hosted is up to the [`WorkerSpawner`].

pub mod handle;
pub mod keyword;
pub mod protocol;
pub mod runtime;
pub mod spawner;

pub use handle::WorkerHandle;
pub use keyword::KeywordResponder;
pub use runtime::{serve, Responder};
pub use spawner::{ProcessSpawner, TaskSpawner, WorkerSpawner};
