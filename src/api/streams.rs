//! Channel table inspection and maintenance endpoints.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::connection_manager::{ConnectionStatus, StreamInfo};
use crate::error::{AppError, StreamError};
use crate::retry::RetryDelayPreview;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct StreamListResponse {
    pub streams: Vec<StreamInfo>,
    pub total_streams: usize,
}

#[derive(Debug, Serialize)]
pub struct StreamStatusResponse {
    pub channel: String,
    pub status: ConnectionStatus,
    pub subscriber_count: usize,
    pub retry_attempt: u32,
}

#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub evicted: usize,
}

/// GET /api/v1/streams
pub async fn list_streams(State(state): State<AppState>) -> Json<StreamListResponse> {
    let streams = state.connection_manager.stream_info();
    let total = streams.len();

    Json(StreamListResponse {
        streams,
        total_streams: total,
    })
}

/// GET /api/v1/streams/{channel}/status
pub async fn stream_status(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<StreamStatusResponse>, AppError> {
    if channel.trim().is_empty() {
        return Err(StreamError::InvalidChannel(channel).into());
    }

    let info = state
        .connection_manager
        .stream_info()
        .into_iter()
        .find(|s| s.name == channel)
        .ok_or_else(|| AppError::NotFound(format!("Stream '{}' is not open", channel)))?;

    Ok(Json(StreamStatusResponse {
        channel: info.name,
        status: info.status,
        subscriber_count: info.subscriber_count,
        retry_attempt: info.retry_attempt,
    }))
}

/// POST /api/v1/streams/cleanup?idle_timeout_ms=
pub async fn cleanup_streams(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Json<CleanupResponse> {
    let idle_timeout = params.idle_timeout_ms.map(Duration::from_millis);
    let evicted = state.connection_manager.force_cleanup_idle(idle_timeout);
    tracing::info!(
        evicted = evicted,
        idle_timeout_ms = ?params.idle_timeout_ms,
        "Manual idle cleanup"
    );

    Json(CleanupResponse { evicted })
}

/// GET /api/v1/retry-preview/{attempt}
pub async fn retry_preview(
    State(state): State<AppState>,
    Path(attempt): Path<u32>,
) -> Json<RetryDelayPreview> {
    Json(state.connection_manager.retry_delay_preview(attempt))
}
