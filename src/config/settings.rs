use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::StreamError;

/// Absolute ceiling applied to any configured retry delay
pub const RETRY_DELAY_CEILING_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Connection manager configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Base URL of the streaming endpoint; the channel name is appended as a path segment
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Reconnection attempts allowed before a channel fails terminally
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Lower bound of every retry wait in milliseconds
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Upper bound of every retry wait in milliseconds (capped at 30s)
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Channels without subscribers idle for longer than this are reclaimed
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Interval of the idle reaper sweep
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    /// Frames buffered per channel for slow subscribers
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Prefix of every exported metric name
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
    /// Channels opened at start-up ahead of any subscriber
    #[serde(default)]
    pub warm_channels: Vec<String>,
}

/// Console log output
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// One JSON object per line instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_endpoint() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

fn default_max_retry_attempts() -> u32 {
    10
}

fn default_base_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    RETRY_DELAY_CEILING_MS
}

fn default_idle_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_reaper_interval_ms() -> u64 {
    60_000 // 1 minute
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_metrics_prefix() -> String {
    "market_stream".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "market-stream-manager".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("stream.endpoint", default_endpoint())?
            .set_default("stream.max_retry_attempts", 10)?
            .set_default("stream.base_retry_delay_ms", 1_000)?
            .set_default("stream.max_retry_delay_ms", 30_000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER__PORT, STREAM__ENDPOINT, STREAM__MAX_RETRY_ATTEMPTS, OTEL__ENABLED, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stream.warm_channels"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl StreamConfig {
    /// Check bounds eagerly so a bad configuration never reaches the channel table
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.endpoint.trim().is_empty() {
            return Err(StreamError::InvalidConfig("endpoint must not be empty".into()));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "base_retry_delay_ms must be positive".into(),
            ));
        }
        if self.max_retry_delay_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "max_retry_delay_ms must be positive".into(),
            ));
        }
        if self.base_retry_delay_ms > self.effective_max_retry_delay_ms() {
            return Err(StreamError::InvalidConfig(format!(
                "base_retry_delay_ms ({}) exceeds max_retry_delay_ms ({})",
                self.base_retry_delay_ms,
                self.effective_max_retry_delay_ms()
            )));
        }
        if self.idle_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig("idle_timeout_ms must be positive".into()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "reaper_interval_ms must be positive".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Configured maximum delay clamped to the system ceiling
    pub fn effective_max_retry_delay_ms(&self) -> u64 {
        self.max_retry_delay_ms.min(RETRY_DELAY_CEILING_MS)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// URL of the physical connection dedicated to one channel
    pub fn channel_url(&self, channel: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), channel)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_retry_attempts: default_max_retry_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            channel_capacity: default_channel_capacity(),
            metrics_prefix: default_metrics_prefix(),
            warm_channels: vec![],
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);

        let stream = StreamConfig::default();
        assert_eq!(stream.max_retry_attempts, 10);
        assert_eq!(stream.base_retry_delay_ms, 1_000);
        assert_eq!(stream.max_retry_delay_ms, 30_000);
        assert_eq!(stream.idle_timeout_ms, 300_000);
        assert_eq!(stream.reaper_interval_ms, 60_000);
        assert!(stream.validate().is_ok());

        let log = LogConfig::default();
        assert_eq!(log.level, "info");
        assert!(!log.json);
    }

    #[test]
    fn test_max_delay_is_hard_capped() {
        let stream = StreamConfig {
            max_retry_delay_ms: 120_000,
            ..Default::default()
        };
        assert_eq!(stream.effective_max_retry_delay_ms(), 30_000);
        assert!(stream.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_bounds() {
        let zero_base = StreamConfig {
            base_retry_delay_ms: 0,
            ..Default::default()
        };
        assert!(matches!(zero_base.validate(), Err(StreamError::InvalidConfig(_))));

        let zero_max = StreamConfig {
            max_retry_delay_ms: 0,
            ..Default::default()
        };
        assert!(matches!(zero_max.validate(), Err(StreamError::InvalidConfig(_))));

        let zero_interval = StreamConfig {
            reaper_interval_ms: 0,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());
    }

    #[test]
    fn test_rejects_base_above_capped_max() {
        let stream = StreamConfig {
            base_retry_delay_ms: 45_000,
            max_retry_delay_ms: 60_000,
            ..Default::default()
        };
        assert!(stream.validate().is_err());
    }

    #[test]
    fn test_channel_url() {
        let stream = StreamConfig {
            endpoint: "wss://example.com/ws/".to_string(),
            ..Default::default()
        };
        assert_eq!(stream.channel_url("btcusdt@trade"), "wss://example.com/ws/btcusdt@trade");
    }
}
