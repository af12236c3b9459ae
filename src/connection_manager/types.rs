//! Channel state and the value types handed to consumers

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::millis_to_datetime;
use crate::error::StreamError;

/// Connection state of a channel as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// A decoded frame delivered to every subscriber of a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    pub channel: String,
    pub received_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Operator view of one channel table entry
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub subscriber_count: usize,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub retry_attempt: u32,
}

/// Event multicast to the subscribers of one channel
#[derive(Debug, Clone)]
pub(crate) enum ChannelEvent {
    Message(Arc<StreamMessage>),
    /// Retry budget exhausted; the channel is gone
    Failed(StreamError),
}

/// State shared between the channel table entry and its connection worker
pub(crate) struct ChannelShared {
    pub name: String,
    pub url: String,
    /// Distinguishes successive entries for the same channel name
    pub generation: Uuid,
    pub events: broadcast::Sender<ChannelEvent>,
    pub cancel: CancellationToken,
    pub created_at: DateTime<Utc>,
    /// Unix milliseconds, written without taking the table lock
    last_activity: AtomicI64,
    retry_attempt: AtomicU32,
}

impl ChannelShared {
    pub fn new(
        name: String,
        url: String,
        capacity: usize,
        cancel: CancellationToken,
        now: DateTime<Utc>,
    ) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            name,
            url,
            generation: Uuid::new_v4(),
            events,
            cancel,
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            retry_attempt: AtomicU32::new(0),
        }
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_activity.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        millis_to_datetime(self.last_activity_ms())
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt.load(Ordering::Acquire)
    }

    pub fn reset_retry_attempt(&self) {
        self.retry_attempt.store(0, Ordering::Release);
    }

    /// Returns the attempt number before the increment
    pub fn next_retry_attempt(&self) -> u32 {
        self.retry_attempt.fetch_add(1, Ordering::AcqRel)
    }
}

/// One row of the channel table
pub(crate) struct ChannelEntry {
    pub shared: Arc<ChannelShared>,
    pub subscribers: usize,
}
