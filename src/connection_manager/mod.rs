//! Channel table, reference-counted connection sharing and reconnection.

mod manager;
mod subscription;
mod types;
mod worker;

pub use manager::ConnectionManager;
pub use subscription::{CancelHandle, Subscription};
pub use types::{ConnectionStatus, StreamInfo, StreamMessage};
