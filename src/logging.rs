//! Structured logging bootstrap.
//!
//! The library itself only emits `tracing` events; binaries embedding the
//! engine call [`init`] once to install a subscriber.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Default filter directive, e.g. `info` or `sourced_sync=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("invalid log filter {0:?}")]
    Filter(String),
    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

/// Install the global `tracing` subscriber.
pub fn init(config: &LogConfig) -> Result<(), LogInitError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|_| LogInitError::Filter(config.level.clone()))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    result.map_err(|_| LogInitError::AlreadyInstalled)
}
