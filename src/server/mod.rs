//! HTTP surface
//!
//! A thin request handler in front of the pool manager.

pub mod http;
pub mod routes;

pub use http::{run, AppState};
