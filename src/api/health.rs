//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::connection_manager::ConnectionStatus;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_connections: u64,
    pub subscribers: u64,
}

/// GET /health
///
/// `degraded` when channels exist but none of them is currently connected.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.connection_manager;
    let streams = manager.stream_info();
    let metrics = manager.metrics();

    let any_connected = streams
        .iter()
        .any(|s| s.status == ConnectionStatus::Connected);
    let status = if streams.is_empty() || any_connected {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_connections: metrics.active_connections,
        subscribers: metrics.subscribers,
    })
}
