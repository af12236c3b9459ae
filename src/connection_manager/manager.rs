use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::metrics::{MetricsSnapshot, StreamMetrics};
use crate::retry::{RetryDelayPreview, RetryPolicy};
use crate::tasks::{IdleReaper, IdleSweep};
use crate::transport::Transport;

use super::subscription::Subscription;
use super::types::{ChannelEntry, ChannelEvent, ChannelShared, ConnectionStatus, StreamInfo};
use super::worker;

/// State owned by a manager and shared with its background tasks
pub(crate) struct ManagerInner {
    pub(crate) config: StreamConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) metrics: StreamMetrics,
    pub(crate) clock: Arc<dyn Clock>,
    /// channel_name -> ChannelEntry
    channels: DashMap<String, ChannelEntry>,
    /// channel_name -> status broadcast; outlives entries while someone watches
    statuses: DashMap<String, watch::Sender<ConnectionStatus>>,
    aggregate: watch::Sender<ConnectionStatus>,
    aggregate_lock: Mutex<()>,
    shutdown: CancellationToken,
    destroyed: AtomicBool,
}

/// Shares one physical connection per channel between any number of
/// subscribers and keeps those connections alive across transient failures.
///
/// Lock order: a `channels` guard may be held while touching `statuses`,
/// never the other way round, and no guard is held across an `.await`.
///
/// Must be created inside a Tokio runtime; dropping the manager destroys it.
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager backed by the system clock
    pub fn new(config: StreamConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit clock
    pub fn with_clock(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        for channel in &config.warm_channels {
            validate_channel(channel)?;
        }

        let retry_policy = RetryPolicy::from_config(&config)?;
        let metrics = StreamMetrics::new(&config.metrics_prefix, clock.clone())?;
        let (aggregate, _) = watch::channel(ConnectionStatus::Disconnected);

        let inner = Arc::new(ManagerInner {
            config,
            transport,
            retry_policy,
            metrics,
            clock,
            channels: DashMap::new(),
            statuses: DashMap::new(),
            aggregate,
            aggregate_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        });

        let reaper = IdleReaper::new(
            Arc::downgrade(&inner),
            inner.config.reaper_interval(),
            inner.config.idle_timeout(),
            inner.shutdown.child_token(),
        );
        tokio::spawn(reaper.run());

        let manager = Self { inner };
        for channel in manager.inner.config.warm_channels.clone() {
            manager.warm(&channel)?;
        }

        tracing::info!(
            endpoint = %manager.inner.config.endpoint,
            max_retry_attempts = manager.inner.config.max_retry_attempts,
            base_retry_delay_ms = manager.inner.retry_policy.base_delay_ms(),
            max_retry_delay_ms = manager.inner.retry_policy.max_delay_ms(),
            "Connection manager started"
        );

        Ok(manager)
    }

    /// Attach a subscriber to `channel`, opening the connection if needed.
    ///
    /// Returns immediately; a new channel starts in `connecting` and its
    /// progress is visible through [`connection_status`](Self::connection_status).
    pub fn subscribe(&self, channel: &str) -> Result<Subscription> {
        validate_channel(channel)?;
        self.ensure_alive()?;

        let inner = &self.inner;
        let now = inner.clock.now();
        let mut created = None;

        let (generation, events, status) = {
            let mut entry = inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| {
                    let shared = inner.new_channel(channel, now);
                    created = Some(shared.clone());
                    ChannelEntry {
                        shared,
                        subscribers: 0,
                    }
                });
            entry.subscribers += 1;
            entry.shared.touch(now.timestamp_millis());
            // Recorded under the entry lock so a racing removal always counts after them
            inner.metrics.subscriber_attached();
            if created.is_some() {
                inner.metrics.record_stream_created();
                inner.publish_status(channel, ConnectionStatus::Connecting);
            }
            (
                entry.shared.generation,
                entry.shared.events.subscribe(),
                inner.status_receiver(channel),
            )
        };

        if let Some(shared) = created {
            tracing::info!(channel = %channel, generation = %shared.generation, "Channel created");
            self.spawn_worker(shared);
        }
        inner.refresh_aggregate();

        let subscription = Subscription::new(
            Arc::downgrade(&self.inner),
            channel.to_string(),
            generation,
            events,
            status,
        );
        tracing::debug!(
            channel = %channel,
            subscription_id = %subscription.id(),
            "Subscriber attached"
        );

        Ok(subscription)
    }

    /// Open `channel` without attaching a subscriber.
    ///
    /// Returns `true` if a new entry was created. A warm entry with no
    /// subscribers is reclaimed by the idle reaper.
    pub fn warm(&self, channel: &str) -> Result<bool> {
        validate_channel(channel)?;
        self.ensure_alive()?;

        let inner = &self.inner;
        let now = inner.clock.now();
        let mut created = None;
        {
            let entry = inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| {
                    let shared = inner.new_channel(channel, now);
                    created = Some(shared.clone());
                    ChannelEntry {
                        shared,
                        subscribers: 0,
                    }
                });
            entry.shared.touch(now.timestamp_millis());
            if created.is_some() {
                inner.metrics.record_stream_created();
                inner.publish_status(channel, ConnectionStatus::Connecting);
            }
        }

        let Some(shared) = created else {
            return Ok(false);
        };
        tracing::info!(channel = %channel, generation = %shared.generation, "Channel warmed");
        self.spawn_worker(shared);
        inner.refresh_aggregate();
        Ok(true)
    }

    /// Status stream for one channel, or the aggregate over all channels.
    ///
    /// Never fails: unknown channels report `disconnected` until created.
    pub fn connection_status(&self, channel: Option<&str>) -> watch::Receiver<ConnectionStatus> {
        match channel {
            None => self.inner.aggregate.subscribe(),
            Some(name) if validate_channel(name).is_err() => {
                watch::channel(ConnectionStatus::Disconnected).1
            }
            Some(name) => self.inner.status_receiver(name),
        }
    }

    /// [`connection_status`](Self::connection_status) as a `Stream`
    pub fn connection_status_stream(&self, channel: Option<&str>) -> WatchStream<ConnectionStatus> {
        WatchStream::new(self.connection_status(channel))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Metrics in Prometheus text exposition format
    pub fn prometheus_metrics(&self) -> String {
        self.inner.metrics.encode()
    }

    /// Current channel table, sorted by channel name
    pub fn stream_info(&self) -> Vec<StreamInfo> {
        self.inner.stream_info()
    }

    /// Evict channels without subscribers idle for longer than `idle_timeout`
    /// (the configured timeout when `None`). Returns the number evicted.
    pub fn force_cleanup_idle(&self, idle_timeout: Option<Duration>) -> usize {
        let timeout = idle_timeout.unwrap_or_else(|| self.inner.config.idle_timeout());
        self.inner.cleanup_idle(timeout)
    }

    /// Backoff window for `attempt` without scheduling anything
    pub fn retry_delay_preview(&self, attempt: u32) -> RetryDelayPreview {
        self.inner.retry_policy.preview(attempt)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Close every connection, clear the table and stop background tasks.
    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(StreamError::Destroyed);
        }
        Ok(())
    }

    fn spawn_worker(&self, shared: Arc<ChannelShared>) {
        let span = tracing::info_span!(
            "channel_worker",
            channel = %shared.name,
            generation = %shared.generation
        );
        tokio::spawn(worker::run_channel(self.inner.clone(), shared).instrument(span));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl ManagerInner {
    fn new_channel(&self, channel: &str, now: chrono::DateTime<chrono::Utc>) -> Arc<ChannelShared> {
        Arc::new(ChannelShared::new(
            channel.to_string(),
            self.config.channel_url(channel),
            self.config.channel_capacity,
            self.shutdown.child_token(),
            now,
        ))
    }

    fn status_sender(
        &self,
        channel: &str,
    ) -> dashmap::mapref::one::RefMut<'_, String, watch::Sender<ConnectionStatus>> {
        self.statuses
            .entry(channel.to_string())
            .or_insert_with(|| watch::channel(ConnectionStatus::Disconnected).0)
    }

    fn status_receiver(&self, channel: &str) -> watch::Receiver<ConnectionStatus> {
        self.status_sender(channel).subscribe()
    }

    fn publish_status(&self, channel: &str, status: ConnectionStatus) {
        if status == ConnectionStatus::Disconnected && !self.statuses.contains_key(channel) {
            return;
        }
        self.status_sender(channel).send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn current_status(&self, channel: &str) -> ConnectionStatus {
        self.statuses
            .get(channel)
            .map(|tx| *tx.borrow())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Publish a status for the generation a worker belongs to; stale
    /// workers of a removed entry are ignored
    pub(crate) fn publish_channel_status(&self, shared: &ChannelShared, status: ConnectionStatus) {
        if let Some(entry) = self.channels.get(&shared.name) {
            if entry.shared.generation == shared.generation {
                self.publish_status(&shared.name, status);
            }
        }
        self.refresh_aggregate();
    }

    /// Recompute the aggregate: `disconnected` with no channels, `connected`
    /// when every channel is, `connecting` otherwise
    fn refresh_aggregate(&self) {
        let _guard = self
            .aggregate_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut any = false;
        let mut all_connected = true;
        for entry in self.channels.iter() {
            any = true;
            if self.current_status(entry.key()) != ConnectionStatus::Connected {
                all_connected = false;
            }
        }

        let aggregate = match (any, all_connected) {
            (false, _) => ConnectionStatus::Disconnected,
            (true, true) => ConnectionStatus::Connected,
            (true, false) => ConnectionStatus::Connecting,
        };
        self.aggregate.send_if_modified(|current| {
            if *current == aggregate {
                return false;
            }
            *current = aggregate;
            true
        });
    }

    /// Remove `channel` if `predicate` holds for its entry.
    ///
    /// The status change and the optional terminal error are published while
    /// the entry is still locked, so no subscriber can attach in between.
    fn remove_channel_where<F>(
        &self,
        channel: &str,
        predicate: F,
        failure: Option<StreamError>,
    ) -> Option<ChannelEntry>
    where
        F: FnOnce(&ChannelEntry) -> bool,
    {
        let (_, entry) = self.channels.remove_if(channel, |_, entry| {
            if !predicate(entry) {
                return false;
            }
            if let Some(error) = failure {
                let _ = entry.shared.events.send(ChannelEvent::Failed(error));
            }
            self.publish_status(channel, ConnectionStatus::Disconnected);
            self.statuses
                .remove_if(channel, |_, tx| tx.receiver_count() == 0);
            true
        })?;

        entry.shared.cancel.cancel();
        self.metrics.record_stream_cleaned_up();
        if entry.subscribers > 0 {
            self.metrics.subscribers_detached(entry.subscribers);
        }
        self.refresh_aggregate();
        Some(entry)
    }

    /// Detach one subscriber; the last one out removes the channel
    pub(crate) fn release(&self, channel: &str, generation: Uuid, subscription_id: Uuid) {
        let now_ms = self.clock.now_ms();
        let remaining = match self.channels.get_mut(channel) {
            Some(mut entry) if entry.shared.generation == generation => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.shared.touch(now_ms);
                self.metrics.subscriber_detached();
                Some(entry.subscribers)
            }
            _ => None,
        };

        // Entry already torn down (terminal failure, reaper or destroy)
        let Some(remaining) = remaining else {
            return;
        };

        tracing::debug!(
            channel = %channel,
            subscription_id = %subscription_id,
            remaining = remaining,
            "Subscriber detached"
        );

        if remaining == 0 {
            let removed = self.remove_channel_where(
                channel,
                |entry| entry.shared.generation == generation && entry.subscribers == 0,
                None,
            );
            if removed.is_some() {
                tracing::info!(channel = %channel, "Channel closed after last subscriber left");
            }
        }
    }

    /// Tear down a channel whose retry budget ran out
    pub(crate) fn fail_channel(&self, shared: &ChannelShared, attempts: u32) {
        let error = StreamError::RetriesExhausted {
            channel: shared.name.clone(),
            attempts,
        };
        let removed = self.remove_channel_where(
            &shared.name,
            |entry| entry.shared.generation == shared.generation,
            Some(error),
        );

        if let Some(entry) = removed {
            self.metrics.record_stream_failed();
            tracing::error!(
                channel = %shared.name,
                attempts = attempts,
                subscribers = entry.subscribers,
                "Retry budget exhausted, channel closed"
            );
        }
    }

    pub(crate) fn cleanup_idle(&self, idle_timeout: Duration) -> usize {
        let now_ms = self.clock.now_ms();
        let timeout_ms = i64::try_from(idle_timeout.as_millis()).unwrap_or(i64::MAX);
        let is_idle = |entry: &ChannelEntry| {
            entry.subscribers == 0
                && now_ms.saturating_sub(entry.shared.last_activity_ms()) > timeout_ms
        };

        let candidates: Vec<(String, Uuid)> = self
            .channels
            .iter()
            .filter(|entry| is_idle(entry.value()))
            .map(|entry| (entry.key().clone(), entry.shared.generation))
            .collect();

        let mut evicted = 0;
        for (channel, generation) in candidates {
            let removed = self.remove_channel_where(
                &channel,
                |entry| entry.shared.generation == generation && is_idle(entry),
                None,
            );
            if removed.is_some() {
                tracing::info!(channel = %channel, "Removing idle channel");
                evicted += 1;
            }
        }

        self.prune_statuses();
        evicted
    }

    /// Drop status senders nobody watches for channels that no longer exist
    fn prune_statuses(&self) {
        let unwatched: Vec<String> = self
            .statuses
            .iter()
            .filter(|tx| tx.receiver_count() == 0)
            .map(|tx| tx.key().clone())
            .collect();

        for channel in unwatched {
            if let Entry::Vacant(_) = self.channels.entry(channel.clone()) {
                self.statuses
                    .remove_if(&channel, |_, tx| tx.receiver_count() == 0);
            }
        }
    }

    fn stream_info(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> = self
            .channels
            .iter()
            .map(|entry| StreamInfo {
                name: entry.key().clone(),
                subscriber_count: entry.subscribers,
                last_activity_at: entry.shared.last_activity(),
                created_at: entry.shared.created_at,
                status: self.current_status(entry.key()),
                retry_attempt: entry.shared.retry_attempt(),
            })
            .collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        streams
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();

        let channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for channel in channels {
            if self.remove_channel_where(&channel, |_| true, None).is_some() {
                closed += 1;
            }
        }

        tracing::info!(closed = closed, "Connection manager destroyed");
    }
}

impl IdleSweep for ManagerInner {
    fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        self.cleanup_idle(idle_timeout)
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.trim().is_empty() {
        return Err(StreamError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::MemoryTransport;

    fn test_config() -> StreamConfig {
        StreamConfig {
            endpoint: "memory://feed".to_string(),
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            metrics_prefix: "unit".to_string(),
            ..Default::default()
        }
    }

    fn manager() -> (ConnectionManager, MemoryTransport) {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(test_config(), Arc::new(transport.clone())).unwrap();
        (manager, transport)
    }

    #[tokio::test]
    async fn test_rejects_empty_channel_name() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.subscribe(""),
            Err(StreamError::InvalidChannel(_))
        ));
        assert!(matches!(
            manager.subscribe("   "),
            Err(StreamError::InvalidChannel(_))
        ));
        assert_eq!(manager.metrics().total_stream_creations, 0);
        assert!(manager.stream_info().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = StreamConfig {
            base_retry_delay_ms: 0,
            ..test_config()
        };
        let result = ConnectionManager::new(config, Arc::new(MemoryTransport::new()));
        assert!(matches!(result, Err(StreamError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_rejects_empty_warm_channel() {
        let config = StreamConfig {
            warm_channels: vec!["".to_string()],
            ..test_config()
        };
        let result = ConnectionManager::new(config, Arc::new(MemoryTransport::new()));
        assert!(matches!(result, Err(StreamError::InvalidChannel(_))));
    }

    #[tokio::test]
    async fn test_shared_entry_counts_subscribers() {
        let (manager, _) = manager();
        let a = manager.subscribe("btcusdt@trade").unwrap();
        let b = manager.subscribe("btcusdt@trade").unwrap();

        let info = manager.stream_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].subscriber_count, 2);
        assert_eq!(manager.metrics().subscribers, 2);

        drop(a);
        assert_eq!(manager.stream_info()[0].subscriber_count, 1);
        drop(b);
        assert!(manager.stream_info().is_empty());
        assert_eq!(manager.metrics().subscribers, 0);
    }

    #[tokio::test]
    async fn test_cancel_twice_is_noop() {
        let (manager, _) = manager();
        let mut a = manager.subscribe("btcusdt@trade").unwrap();
        let _b = manager.subscribe("btcusdt@trade").unwrap();

        assert!(a.cancel());
        assert!(!a.cancel());
        assert!(!a.cancel_handle().cancel());
        assert_eq!(manager.stream_info()[0].subscriber_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_handle_wakes_pending_recv() {
        let (manager, _) = manager();
        let mut a = manager.subscribe("btcusdt@trade").unwrap();
        let _b = manager.subscribe("btcusdt@trade").unwrap();
        let handle = a.cancel_handle();

        let waiter = tokio::spawn(async move { a.recv().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.cancel());

        let ended = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("recv should wake after cancel")
            .unwrap();
        assert!(ended);
        assert_eq!(manager.stream_info()[0].subscriber_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_reports_disconnected() {
        let (manager, _) = manager();
        assert_eq!(
            *manager.connection_status(Some("nope@trade")).borrow(),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            *manager.connection_status(Some("")).borrow(),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            *manager.connection_status(None).borrow(),
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_warm_channel_reaped_when_idle() {
        let clock = Arc::new(ManualClock::default());
        let manager = ConnectionManager::with_clock(
            test_config(),
            Arc::new(MemoryTransport::new()),
            clock.clone(),
        )
        .unwrap();

        assert!(manager.warm("ethusdt@depth").unwrap());
        assert!(!manager.warm("ethusdt@depth").unwrap());
        assert_eq!(manager.stream_info()[0].subscriber_count, 0);

        assert_eq!(manager.force_cleanup_idle(Some(Duration::from_secs(60))), 0);
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(manager.force_cleanup_idle(Some(Duration::from_secs(60))), 1);

        let metrics = manager.metrics();
        assert_eq!(metrics.active_connections, 0);
        assert_eq!(metrics.total_stream_cleanups, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_blocks_subscribe() {
        let (manager, _) = manager();
        let _a = manager.subscribe("btcusdt@trade").unwrap();
        let _b = manager.subscribe("ethusdt@trade").unwrap();

        manager.destroy();
        manager.destroy();

        assert!(manager.is_destroyed());
        assert!(manager.stream_info().is_empty());
        assert_eq!(manager.metrics().total_stream_cleanups, 2);
        assert!(matches!(
            manager.subscribe("btcusdt@trade"),
            Err(StreamError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_retry_preview_uses_configured_bounds() {
        let config = StreamConfig {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            ..test_config()
        };
        let manager = ConnectionManager::new(config, Arc::new(MemoryTransport::new())).unwrap();
        let preview = manager.retry_delay_preview(5);
        assert_eq!(preview.exponential_ms, 32_000);
        assert_eq!(preview.clamped_ms, 30_000);
        assert_eq!(preview.min_bound_ms, 1_000);
    }
}
