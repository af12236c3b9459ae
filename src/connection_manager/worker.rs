//! Per-channel connection worker.
//!
//! One task per channel generation owns the physical connection: it opens
//! it, fans frames out to subscribers and reconnects with backoff until the
//! retry budget runs out or the channel is cancelled.

use std::sync::Arc;

use crate::error::TransportError;
use crate::transport::{ChannelConnection, Frame};

use super::manager::ManagerInner;
use super::types::{ChannelEvent, ChannelShared, ConnectionStatus, StreamMessage};

enum PumpOutcome {
    /// The channel was removed or the manager destroyed
    Cancelled,
    /// The connection ended without a local close
    Lost(TransportError),
}

pub(crate) async fn run_channel(inner: Arc<ManagerInner>, shared: Arc<ChannelShared>) {
    let cancel = shared.cancel.clone();

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            result = inner.transport.open(&shared.url) => result,
        };

        match opened {
            Ok(mut connection) => {
                if cancel.is_cancelled() {
                    close_connection(&shared, connection.as_mut()).await;
                    return;
                }

                shared.reset_retry_attempt();
                shared.touch(inner.clock.now_ms());
                inner.publish_channel_status(&shared, ConnectionStatus::Connected);
                tracing::info!(channel = %shared.name, url = %shared.url, "Channel connected");

                match pump(&inner, &shared, connection.as_mut()).await {
                    PumpOutcome::Cancelled => {
                        close_connection(&shared, connection.as_mut()).await;
                        return;
                    }
                    PumpOutcome::Lost(error) => {
                        inner.metrics.record_error();
                        tracing::warn!(
                            channel = %shared.name,
                            error = %error,
                            "Channel connection lost"
                        );
                    }
                }
            }
            Err(error) => {
                inner.metrics.record_error();
                tracing::warn!(
                    channel = %shared.name,
                    attempt = shared.retry_attempt(),
                    error = %error,
                    "Failed to open channel connection"
                );
            }
        }

        let attempt = shared.retry_attempt();
        if attempt >= inner.config.max_retry_attempts {
            inner.fail_channel(&shared, attempt);
            return;
        }

        inner.publish_channel_status(&shared, ConnectionStatus::Connecting);
        let delay = inner.retry_policy.delay(attempt);
        shared.next_retry_attempt();
        inner.metrics.record_retry();

        tracing::info!(
            channel = %shared.name,
            attempt = attempt + 1,
            max_attempts = inner.config.max_retry_attempts,
            delay_ms = delay.chosen_ms,
            "Scheduling reconnection"
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay.chosen()) => {}
        }
    }
}

async fn pump(
    inner: &ManagerInner,
    shared: &ChannelShared,
    connection: &mut dyn ChannelConnection,
) -> PumpOutcome {
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return PumpOutcome::Cancelled,
            next = connection.recv() => next,
        };

        match next {
            Some(Ok(frame)) => deliver(inner, shared, frame),
            Some(Err(error)) => return PumpOutcome::Lost(error),
            None => {
                return PumpOutcome::Lost(TransportError::Closed("stream ended".to_string()))
            }
        }
    }
}

/// Decode a frame and multicast it to the channel's current subscribers
fn deliver(inner: &ManagerInner, shared: &ChannelShared, frame: Frame) {
    let received_at = inner.clock.now();
    shared.touch(received_at.timestamp_millis());
    inner.metrics.record_frame();

    let payload = match serde_json::from_slice::<serde_json::Value>(frame.as_bytes()) {
        Ok(payload) => payload,
        Err(e) => {
            inner.metrics.record_decode_error();
            tracing::warn!(channel = %shared.name, error = %e, "Dropping undecodable frame");
            return;
        }
    };

    let message = Arc::new(StreamMessage {
        channel: shared.name.clone(),
        received_at,
        payload,
    });

    // No receivers is fine: a warm channel has nobody attached yet
    let _ = shared.events.send(ChannelEvent::Message(message));
}

async fn close_connection(shared: &ChannelShared, connection: &mut dyn ChannelConnection) {
    match connection.close().await {
        Ok(()) => tracing::info!(channel = %shared.name, "Channel connection closed"),
        Err(e) => {
            tracing::debug!(channel = %shared.name, error = %e, "Error while closing channel connection")
        }
    }
}
