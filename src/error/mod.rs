use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the connection manager to its callers and subscribers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Invalid channel name: {0:?}")]
    InvalidChannel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel {channel} failed after {attempts} reconnection attempts")]
    RetriesExhausted { channel: String, attempts: u32 },

    #[error("Connection manager has been destroyed")]
    Destroyed,

    #[error("Metrics registry error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for StreamError {
    fn from(e: prometheus::Error) -> Self {
        StreamError::Metrics(e.to_string())
    }
}

/// Errors reported by a transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// HTTP-facing error for the operator API
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = match &self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Stream(e) => {
                let msg = e.to_string();
                let (status, code) = match e {
                    StreamError::InvalidChannel(_) | StreamError::InvalidConfig(_) => {
                        (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                    }
                    StreamError::Destroyed => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
                    StreamError::RetriesExhausted { .. } => {
                        (StatusCode::BAD_GATEWAY, "UPSTREAM_UNAVAILABLE")
                    }
                    StreamError::Metrics(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "METRICS_ERROR")
                    }
                };
                (status, code, msg.clone(), msg)
            }
            AppError::Internal(e) => {
                let log_msg = e.clone();
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, log_msg)
            }
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %log_message,
            "API error"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: client_message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
