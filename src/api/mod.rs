//! API layer - operator HTTP endpoints over the connection manager.

mod health;
mod metrics;
mod routes;
mod streams;

pub use health::{health, HealthResponse};
pub use metrics::{metrics_snapshot, prometheus_metrics};
pub use routes::api_routes;
pub use streams::{
    cleanup_streams, list_streams, retry_preview, stream_status, CleanupResponse,
    StreamListResponse, StreamStatusResponse,
};
