//! Route handlers
//!
//! - `GET /bots?uuid=<bot>&msg=<question>` asks a bot and returns its answer
//! - `GET /health` liveness probe
//! - `GET /status` pool snapshot and counters

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::http::{error_response, json_response, AppState};
use crate::types::BotIdentity;

#[derive(Debug, Default, Deserialize)]
struct AskQuery {
    uuid: Option<String>,
    msg: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub bot_id: String,
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub mode: &'static str,
    pub server: String,
    pub bots: usize,
}

pub async fn ask_bot(state: &AppState, query: Option<&str>) -> Response<Full<Bytes>> {
    let params: AskQuery = match serde_urlencoded::from_str(query.unwrap_or("")) {
        Ok(params) => params,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid query string: {}", e))
        }
    };

    let Some(uuid) = params.uuid.filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'uuid' parameter");
    };
    let Some(msg) = params.msg.filter(|m| !m.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'msg' parameter");
    };

    let identity = BotIdentity::from(uuid.as_str());
    match state.pool.ask(msg, &identity).await {
        Ok(answer) => json_response(
            StatusCode::OK,
            &AskResponse {
                bot_id: uuid,
                answer,
            },
        ),
        Err(e) => {
            warn!(identity = %identity, "Ask failed: {}", e);
            let (status, message) = e.into_status_code_and_body();
            error_response(status, &message)
        }
    }
}

pub fn health(state: &AppState) -> Response<Full<Bytes>> {
    let status = state.pool.status();
    json_response(
        StatusCode::OK,
        &HealthResponse {
            healthy: true,
            version: env!("CARGO_PKG_VERSION"),
            uptime: state.started.elapsed().as_secs(),
            mode: if state.dev_mode { "development" } else { "production" },
            server: status.server_addr,
            bots: status.entries.len(),
        },
    )
}

pub fn status(state: &AppState) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &state.pool.status())
}
