mod settings;

pub use settings::{
    LogConfig, OtelConfig, ServerConfig, Settings, StreamConfig, RETRY_DELAY_CEILING_MS,
};
