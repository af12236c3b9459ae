//! Subscriber attachment to a shared channel

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use uuid::Uuid;

use super::manager::ManagerInner;
use super::types::{ChannelEvent, ConnectionStatus, StreamMessage};
use crate::error::StreamError;

struct CancelState {
    done: AtomicBool,
    /// Wakes a subscription parked in `poll_next`
    token: CancellationToken,
    manager: Weak<ManagerInner>,
    channel: String,
    generation: Uuid,
    subscription_id: Uuid,
}

/// Detaches one subscriber from its channel.
///
/// Cloneable so the cancel side can be handed to another task. Only the
/// first call has an effect.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Returns `true` if this call detached the subscriber
    pub fn cancel(&self) -> bool {
        if self.state.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.token.cancel();
        if let Some(manager) = self.state.manager.upgrade() {
            manager.release(
                &self.state.channel,
                self.state.generation,
                self.state.subscription_id,
            );
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }
}

/// A live attachment to one channel.
///
/// Yields every decoded frame received after attaching, in arrival order.
/// Transient reconnects are invisible here apart from a gap in data; when
/// the retry budget runs out the stream yields one error and ends.
/// Dropping the subscription cancels it.
pub struct Subscription {
    id: Uuid,
    channel: String,
    events: BroadcastStream<ChannelEvent>,
    status: watch::Receiver<ConnectionStatus>,
    cancel: CancelHandle,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        manager: Weak<ManagerInner>,
        channel: String,
        generation: Uuid,
        events: tokio::sync::broadcast::Receiver<ChannelEvent>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let cancelled = Box::pin(token.clone().cancelled_owned());
        let cancel = CancelHandle {
            state: Arc::new(CancelState {
                done: AtomicBool::new(false),
                token,
                manager,
                channel: channel.clone(),
                generation,
                subscription_id: id,
            }),
        };

        Self {
            id,
            channel,
            events: BroadcastStream::new(events),
            status,
            cancel,
            cancelled,
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Status stream of the subscribed channel
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Detach from the channel; further calls are no-ops
    pub fn cancel(&mut self) -> bool {
        self.finished = true;
        self.cancel.cancel()
    }

    /// Wait for the next message, or `None` once the subscription ended
    pub async fn recv(&mut self) -> Option<Result<Arc<StreamMessage>, StreamError>> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Result<Arc<StreamMessage>, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished || self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.finished = true;
            return Poll::Ready(None);
        }

        loop {
            match futures::ready!(Pin::new(&mut self.events).poll_next(cx)) {
                Some(Ok(ChannelEvent::Message(message))) => {
                    return Poll::Ready(Some(Ok(message)));
                }
                Some(Ok(ChannelEvent::Failed(error))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(
                        subscription_id = %self.id,
                        channel = %self.channel,
                        skipped = skipped,
                        "Subscriber lagging behind, frames skipped"
                    );
                }
                None => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
