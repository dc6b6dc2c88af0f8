//! REST endpoints: forward plus the small admin set

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::AppState;
use crate::registry::{RegistryError, Token};
use crate::relay::DispatchError;

/// `POST /v1/forward` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub body: String,
    /// Missing or 0 uses the relay's default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /v1/forward` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
    /// `ok`, `timeout`, `cancelled`, `unavailable`, `invalid_argument` or `internal`
    pub status: String,
    /// Status reported by the node, when it answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub body: String,
}

/// One row of `GET /v1/peers`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub ip: String,
    pub port: u16,
    pub token: Token,
    pub created_at: DateTime<Utc>,
    /// A node tunnel currently serves this peer
    pub attached: bool,
    pub waiters: usize,
    pub pending: bool,
}

pub(super) async fn forward(
    State(state): State<AppState>,
    Json(request): Json<ForwardRequest>,
) -> (StatusCode, Json<ForwardResponse>) {
    let timeout = state
        .dispatcher
        .effective_timeout(request.timeout_ms.map(Duration::from_millis));

    log::debug!(
        "Forward request: peer={}:{}, len={}, timeout={:?}",
        request.ip,
        request.port,
        request.body.len(),
        timeout
    );

    let forwarded = state
        .dispatcher
        .forward(&request.ip, request.port, &request.body, timeout)
        .await;

    match forwarded.result {
        Ok(response) => (
            node_status(response.code),
            Json(ForwardResponse {
                token: forwarded.token,
                status: "ok".to_string(),
                code: Some(response.code),
                body: response.body,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(ForwardResponse {
                token: forwarded.token,
                status: e.code().to_string(),
                code: None,
                body: e.to_string(),
            }),
        ),
    }
}

/// HTTP status for a node's answer: its own code when that is a valid HTTP
/// status, 200 otherwise
pub fn node_status(code: i32) -> StatusCode {
    u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK)
}

/// HTTP status for a failed forward
///
/// Timeout and cancellation stay distinguishable: 504 means the node may
/// still answer a retry, 502 means its tunnel is gone.
pub fn status_for(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Cancelled => StatusCode::BAD_GATEWAY,
        DispatchError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Registry(RegistryError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
        DispatchError::Registry(RegistryError::Capacity(_)) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Registry(_) | DispatchError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(super) async fn ping() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// 200 when at least one node tunnel is connected
pub(super) async fn status(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.registry.has_attached() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::NOT_FOUND, "Not Found")
    }
}

pub(super) async fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub(super) async fn peers(State(state): State<AppState>) -> Json<Vec<PeerSummary>> {
    let peers = state
        .registry
        .entries()
        .iter()
        .map(|entry| PeerSummary {
            ip: entry.ip().to_string(),
            port: entry.port(),
            token: entry.token(),
            created_at: entry.created_at(),
            attached: entry.is_attached(),
            waiters: entry.waiters(),
            pending: entry.has_pending_response(),
        })
        .collect();

    Json(peers)
}

pub(super) async fn forbidden() -> (StatusCode, &'static str) {
    (StatusCode::FORBIDDEN, "Forbidden")
}
