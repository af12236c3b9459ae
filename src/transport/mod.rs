//! Physical connection collaborator.
//!
//! The manager never speaks a wire protocol itself. It asks a [`Transport`]
//! to open one [`ChannelConnection`] per channel and then pulls frames from
//! it. An abrupt closure is reported by `recv` returning `None` or an error.

mod memory;
mod websocket;

use async_trait::async_trait;

use crate::error::TransportError;

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

/// A single frame as it left the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }
}

/// One open physical connection dedicated to one channel
#[async_trait]
pub trait ChannelConnection: Send {
    /// Write a frame to the remote endpoint
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Wait for the next frame.
    ///
    /// `None` or `Some(Err(_))` means the connection ended without a local
    /// `close`. Must be cancel safe: it is raced against shutdown.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for channel connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Box<dyn ChannelConnection>, TransportError>;
}
