//! Prometheus metrics for the stream connection manager.
//!
//! Each manager owns its own registry so that several managers (or tests)
//! can live in one process without sharing counters:
//! - Channel table gauge and its high water mark
//! - Stream creation / cleanup counters
//! - Retry and error accounting with last-event timestamps
//! - Frame throughput and decode failures

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::clock::{millis_to_datetime, Clock};
use crate::error::StreamError;

/// Point-in-time copy of the manager's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub active_connections_high_water_mark: u64,
    pub total_retry_attempts: u64,
    pub total_stream_creations: u64,
    pub total_stream_cleanups: u64,
    pub total_stream_failures: u64,
    pub total_frames_received: u64,
    pub total_decode_errors: u64,
    pub subscribers: u64,
    pub last_retry_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Counters and gauges for one connection manager
pub struct StreamMetrics {
    registry: Registry,
    clock: Arc<dyn Clock>,
    /// Serializes the active gauge with its high water mark
    gauge_lock: Mutex<()>,
    active_connections: IntGauge,
    active_connections_hwm: IntGauge,
    retry_attempts_total: IntCounter,
    stream_creations_total: IntCounter,
    stream_cleanups_total: IntCounter,
    stream_failures_total: IntCounter,
    frames_received_total: IntCounter,
    decode_errors_total: IntCounter,
    subscribers: IntGauge,
    last_retry_timestamp: IntGauge,
    last_error_timestamp: IntGauge,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn int_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl StreamMetrics {
    /// Create a registry whose metric names start with `prefix`
    pub fn new(prefix: &str, clock: Arc<dyn Clock>) -> Result<Self, StreamError> {
        let prefix = prefix.trim_end_matches('_');
        let registry = if prefix.is_empty() {
            Registry::new()
        } else {
            Registry::new_custom(Some(prefix.to_string()), None)?
        };

        Ok(Self {
            active_connections: int_gauge(
                &registry,
                "active_connections",
                "Number of channels currently held in the channel table",
            )?,
            active_connections_hwm: int_gauge(
                &registry,
                "active_connections_high_water_mark",
                "Highest number of simultaneously active channels since start",
            )?,
            retry_attempts_total: int_counter(
                &registry,
                "retry_attempts_total",
                "Total reconnection attempts scheduled across all channels",
            )?,
            stream_creations_total: int_counter(
                &registry,
                "stream_creations_total",
                "Total channel table insertions",
            )?,
            stream_cleanups_total: int_counter(
                &registry,
                "stream_cleanups_total",
                "Total channel table removals",
            )?,
            stream_failures_total: int_counter(
                &registry,
                "stream_failures_total",
                "Total channels torn down after exhausting their retry budget",
            )?,
            frames_received_total: int_counter(
                &registry,
                "frames_received_total",
                "Total frames received from upstream connections",
            )?,
            decode_errors_total: int_counter(
                &registry,
                "decode_errors_total",
                "Total frames dropped because they could not be decoded",
            )?,
            subscribers: int_gauge(
                &registry,
                "subscribers",
                "Number of attached subscribers across all channels",
            )?,
            last_retry_timestamp: int_gauge(
                &registry,
                "last_retry_timestamp_ms",
                "Unix time in milliseconds of the most recent scheduled retry",
            )?,
            last_error_timestamp: int_gauge(
                &registry,
                "last_error_timestamp_ms",
                "Unix time in milliseconds of the most recent connection error",
            )?,
            registry,
            clock,
            gauge_lock: Mutex::new(()),
        })
    }

    fn lock_gauges(&self) -> MutexGuard<'_, ()> {
        self.gauge_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a channel table insertion
    pub fn record_stream_created(&self) {
        let _guard = self.lock_gauges();
        self.stream_creations_total.inc();
        self.active_connections.inc();
        let active = self.active_connections.get();
        if active > self.active_connections_hwm.get() {
            self.active_connections_hwm.set(active);
        }
    }

    /// Record a channel table removal
    pub fn record_stream_cleaned_up(&self) {
        let _guard = self.lock_gauges();
        self.stream_cleanups_total.inc();
        self.active_connections.dec();
    }

    /// Record a channel that exhausted its retry budget
    pub fn record_stream_failed(&self) {
        self.stream_failures_total.inc();
    }

    /// Record a scheduled reconnection attempt
    pub fn record_retry(&self) {
        self.retry_attempts_total.inc();
        self.last_retry_timestamp.set(self.clock.now_ms());
    }

    /// Record a failed open or an abrupt close
    pub fn record_error(&self) {
        self.last_error_timestamp.set(self.clock.now_ms());
    }

    pub fn record_frame(&self) {
        self.frames_received_total.inc();
    }

    pub fn record_decode_error(&self) {
        self.decode_errors_total.inc();
    }

    pub fn subscriber_attached(&self) {
        self.subscribers.inc();
    }

    pub fn subscriber_detached(&self) {
        self.subscribers.dec();
    }

    /// Drop `count` subscribers at once (channel teardown)
    pub fn subscribers_detached(&self, count: usize) {
        self.subscribers.sub(count as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        // Creations, cleanups and the gauge are read together so they always agree
        let (active, hwm, creations, cleanups) = {
            let _guard = self.lock_gauges();
            (
                self.active_connections.get(),
                self.active_connections_hwm.get(),
                self.stream_creations_total.get(),
                self.stream_cleanups_total.get(),
            )
        };

        MetricsSnapshot {
            active_connections: active.max(0) as u64,
            active_connections_high_water_mark: hwm.max(0) as u64,
            total_retry_attempts: self.retry_attempts_total.get(),
            total_stream_creations: creations,
            total_stream_cleanups: cleanups,
            total_stream_failures: self.stream_failures_total.get(),
            total_frames_received: self.frames_received_total.get(),
            total_decode_errors: self.decode_errors_total.get(),
            subscribers: self.subscribers.get().max(0) as u64,
            last_retry_time: timestamp(self.last_retry_timestamp.get()),
            last_error_time: timestamp(self.last_error_timestamp.get()),
        }
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let metric_families = {
            let _guard = self.lock_gauges();
            self.registry.gather()
        };

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode Prometheus metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn timestamp(ms: i64) -> Option<DateTime<Utc>> {
    (ms > 0).then(|| millis_to_datetime(ms))
}
