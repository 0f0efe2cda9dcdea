//! Process-wide settings: broker connection, stream policy, subscription
//! defaults and logging.
//!
//! Loaded once at startup from defaults, an optional TOML file and
//! `EVENTING__*` environment variables (in that order of precedence).
//!
//! ```ignore
//! let settings = Settings::load(Some(Path::new("eventing.toml")))?;
//! settings.validate()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogConfig;

pub const DEFAULT_MAX_RECONNECTS: u32 = 10;
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 10;
pub const DEFAULT_STREAM_NAME: &str = "eventing";
pub const DEFAULT_PENDING_MSGS_LIMIT: usize = 512 * 1024;
pub const DEFAULT_PENDING_BYTES_LIMIT: usize = 64 * 1024 * 1024;

const ENV_PREFIX: &str = "EVENTING";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the broker keeps stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Lost when the broker process restarts.
    Memory,
    /// Survives broker process restarts.
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep a message until every interested consumer acknowledged it.
    Interest,
    /// Keep messages until stream limits evict them.
    Limits,
    /// Remove a message on its first acknowledgement.
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Reject new messages when the stream is full.
    New,
    /// Evict the oldest messages when the stream is full.
    Old,
}

/// Starting point of a newly created consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverPolicy {
    All,
    New,
    Last,
}

/// Broker connection and stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    /// Automatic reconnect attempts after a connection loss. 0 disables them.
    pub max_reconnects: u32,
    #[serde(with = "humantime_serde")]
    pub reconnect_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on every stream/consumer management request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub stream_name: String,
    pub subject_prefix: String,
    pub storage_type: StorageType,
    pub retention_policy: RetentionPolicy,
    pub discard_policy: DiscardPolicy,
    /// -1 means unlimited.
    pub max_messages: i64,
    /// -1 means unlimited.
    pub max_bytes: i64,
    pub deliver_policy: DeliverPolicy,
    /// How long the broker waits for an ack before redelivering.
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_wait: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            subject_prefix: DEFAULT_STREAM_NAME.to_string(),
            storage_type: StorageType::Memory,
            retention_policy: RetentionPolicy::Interest,
            discard_policy: DiscardPolicy::New,
            max_messages: -1,
            max_bytes: -1,
            deliver_policy: DeliverPolicy::All,
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// Per-consumer delivery defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDefaults {
    /// Used when a subscription spec does not set its own bound.
    pub max_in_flight_messages: u32,
    /// Must stay below `BrokerConfig::ack_wait`.
    #[serde(with = "humantime_serde")]
    pub dispatch_timeout: Duration,
    pub pending_msgs_limit: usize,
    pub pending_bytes_limit: usize,
    /// How long one fetch waits for messages before the loop re-checks its state.
    #[serde(with = "humantime_serde")]
    pub fetch_wait: Duration,
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            max_in_flight_messages: DEFAULT_MAX_IN_FLIGHT,
            dispatch_timeout: Duration::from_secs(10),
            pending_msgs_limit: DEFAULT_PENDING_MSGS_LIMIT,
            pending_bytes_limit: DEFAULT_PENDING_BYTES_LIMIT,
            fetch_wait: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub subscriptions: SubscriptionDefaults,
    pub log: LogConfig,
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment.
    ///
    /// Environment keys use the `EVENTING` prefix and `__` as the nesting
    /// separator, e.g. `EVENTING__BROKER__MAX_RECONNECTS=0`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let broker = &defaults.broker;
        let subs = &defaults.subscriptions;

        let mut builder = Config::builder()
            .set_default("broker.url", broker.url.clone())?
            .set_default("broker.max_reconnects", broker.max_reconnects)?
            .set_default("broker.reconnect_wait", "3s")?
            .set_default("broker.connect_timeout", "5s")?
            .set_default("broker.request_timeout", "5s")?
            .set_default("broker.stream_name", broker.stream_name.clone())?
            .set_default("broker.subject_prefix", broker.subject_prefix.clone())?
            .set_default("broker.storage_type", "memory")?
            .set_default("broker.retention_policy", "interest")?
            .set_default("broker.discard_policy", "new")?
            .set_default("broker.max_messages", broker.max_messages)?
            .set_default("broker.max_bytes", broker.max_bytes)?
            .set_default("broker.deliver_policy", "all")?
            .set_default("broker.ack_wait", "30s")?
            .set_default(
                "subscriptions.max_in_flight_messages",
                subs.max_in_flight_messages,
            )?
            .set_default("subscriptions.dispatch_timeout", "10s")?
            .set_default(
                "subscriptions.pending_msgs_limit",
                subs.pending_msgs_limit as u64,
            )?
            .set_default(
                "subscriptions.pending_bytes_limit",
                subs.pending_bytes_limit as u64,
            )?
            .set_default("subscriptions.fetch_wait", "250ms")?
            .set_default("log.format", "json")?
            .set_default("log.level", "info")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.url.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.url must not be empty".into()));
        }
        if broker.stream_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "broker.stream_name must not be empty".into(),
            ));
        }
        if broker.subject_prefix.is_empty()
            || broker
                .subject_prefix
                .chars()
                .any(|c| c.is_whitespace() || c == '*' || c == '>')
        {
            return Err(ConfigError::Invalid(format!(
                "broker.subject_prefix {:?} is not a valid subject",
                broker.subject_prefix
            )));
        }
        if self.subscriptions.max_in_flight_messages == 0 {
            return Err(ConfigError::Invalid(
                "subscriptions.max_in_flight_messages must be positive".into(),
            ));
        }
        if self.subscriptions.dispatch_timeout >= broker.ack_wait {
            return Err(ConfigError::Invalid(format!(
                "subscriptions.dispatch_timeout ({:?}) must be shorter than broker.ack_wait ({:?})",
                self.subscriptions.dispatch_timeout, broker.ack_wait
            )));
        }
        Ok(())
    }
}
