//! Capability interface the engine requires from a streaming broker.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{BrokerConfig, DeliverPolicy, DiscardPolicy, RetentionPolicy, StorageType};
use crate::error::BrokerError;

/// Stream definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageType,
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    /// -1 means unlimited.
    pub max_messages: i64,
    /// -1 means unlimited.
    pub max_bytes: i64,
}

impl StreamConfig {
    pub fn from_broker_config(config: &BrokerConfig, subjects: Vec<String>) -> Self {
        Self {
            name: config.stream_name.clone(),
            subjects,
            storage: config.storage_type,
            retention: config.retention_policy,
            discard: config.discard_policy,
            max_messages: config.max_messages,
            max_bytes: config.max_bytes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckPolicy {
    /// Every message must be acknowledged individually.
    Explicit,
    /// Messages count as acknowledged once delivered.
    None,
}

/// Durable consumer definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
    pub ack_wait: Duration,
    /// Cap on delivered-but-unacknowledged messages.
    pub max_ack_pending: u32,
    pub deliver_policy: DeliverPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub config: ConsumerConfig,
    pub num_ack_pending: usize,
    /// Messages matching the filter that were never delivered.
    pub num_pending: u64,
    /// Total deliveries, redeliveries included.
    pub delivered: u64,
}

/// Bounds of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub max_messages: usize,
    pub max_bytes: usize,
    /// How long to wait for at least one message.
    pub wait: Duration,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub stream_sequence: u64,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl BrokerMessage {
    pub fn size(&self) -> usize {
        message_size(&self.subject, &self.payload, &self.headers)
    }
}

pub(crate) fn message_size(
    subject: &str,
    payload: &[u8],
    headers: &BTreeMap<String, String>,
) -> usize {
    subject.len()
        + payload.len()
        + headers
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
}

/// Raw connection notifications emitted by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    Reconnected,
    Closed,
}

/// Opens client connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: BrokerClient;

    async fn connect(&self, url: &str, timeout: Duration) -> Result<Self::Client, BrokerError>;
}

/// A connected broker client.
///
/// Clones share one underlying connection. A client never reconnects on its
/// own; it reports [`ConnectionEvent`]s and whoever owns the reconnect policy
/// calls [`reconnect`](Self::reconnect).
#[async_trait]
pub trait BrokerClient: Clone + Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Try to re-establish a dropped connection once.
    async fn reconnect(&self) -> Result<(), BrokerError>;

    /// Close the connection for good. Further calls fail with `Closed`.
    async fn close(&self);

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError>;

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError>;

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError>;

    async fn delete_stream(&self, stream: &str) -> Result<(), BrokerError>;

    async fn consumer_info(&self, stream: &str, consumer: &str)
        -> Result<ConsumerInfo, BrokerError>;

    async fn list_consumers(&self, stream: &str) -> Result<Vec<String>, BrokerError>;

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError>;

    /// Update mutable consumer settings (`max_ack_pending`, `ack_wait`) in place.
    async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError>;

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), BrokerError>;

    /// Pull up to `request` messages for a consumer. Returns an empty batch
    /// when nothing arrived within `request.wait`.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        request: FetchRequest,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;

    async fn ack(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError>;

    /// Acknowledge without success: the message is never redelivered.
    async fn term(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError>;

    /// Publish into whichever stream captures `subject`. Returns the stream sequence.
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
    ) -> Result<u64, BrokerError>;
}

/// Whether `subject` matches `pattern`, where `*` matches exactly one token
/// and a trailing `>` matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b"));
        assert!(!subject_matches("a.b", "a.b.c"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*", "a.b.c"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("a.>", "a.b"));
        assert!(subject_matches("a.>", "a.b.c.d"));
        assert!(!subject_matches("a.>", "a"));
        assert!(!subject_matches("b.>", "a.b"));
    }
}
