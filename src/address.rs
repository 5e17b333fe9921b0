//! Self-identification
//!
//! Other instances find our bots through the address we publish under
//! `SERVER-<addr>` and `BOT-<id>`. It comes from `ADVERTISE_ADDR` when set,
//! otherwise from the cloud metadata endpoint.

use std::time::Duration;
use tracing::info;

use crate::types::{PoolError, Result};

/// The metadata endpoint is link-local; anything slower means it is not there
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Determine the address this server publishes in the directory
pub async fn resolve_server_address(advertise: Option<&str>, metadata_url: &str) -> Result<String> {
    if let Some(addr) = advertise.map(str::trim).filter(|a| !a.is_empty()) {
        info!(addr, "Using configured advertise address");
        return Ok(addr.to_string());
    }

    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .user_agent("botpool/0.1")
        .build()
        .map_err(|e| PoolError::Config(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(metadata_url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            PoolError::Config(format!(
                "Could not query instance metadata at {} (set ADVERTISE_ADDR to skip): {}",
                metadata_url, e
            ))
        })?;

    let body = response
        .text()
        .await
        .map_err(|e| PoolError::Config(format!("Failed to read instance metadata: {}", e)))?;

    let addr = body.trim();
    if addr.is_empty() {
        return Err(PoolError::Config(format!(
            "Instance metadata at {} returned an empty address",
            metadata_url
        )));
    }

    info!(addr, source = metadata_url, "Resolved server address from metadata");
    Ok(addr.to_string())
}
