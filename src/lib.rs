// Shared infrastructure
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;

// Connection sharing
pub mod connection_manager;
pub mod transport;

// Operator surface
pub mod api;
pub mod server;

// Supporting modules
pub mod tasks;
pub mod telemetry;

pub use connection_manager::{
    CancelHandle, ConnectionManager, ConnectionStatus, StreamInfo, StreamMessage, Subscription,
};
pub use error::{StreamError, TransportError};
