//! Error taxonomy for the synchronization engine.
//!
//! `SyncError` is what controllers see. Broker and sink failures are mapped
//! into it at the reconciler boundary so callers branch on [`ErrorKind`]
//! instead of transport details.

use std::fmt;

use thiserror::Error;

/// Taxonomy tag carried by every [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broker unreachable or stream missing. Transient, retry later.
    BackendUnavailable,
    /// Reconnect attempts exhausted. Fatal until the process is restarted.
    ConnectionError,
    /// The cleaner rejected an event type. Permanent until the subscription changes.
    InvalidEventType,
    /// A durable consumer exists on the broker but is not tracked locally.
    MissingSubscription,
    /// The broker rejected a consumer create/update/delete.
    ConsumerOperationFailed,
    /// The subscription spec itself is malformed.
    InvalidSubscription,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::ConnectionError => "ConnectionError",
            ErrorKind::InvalidEventType => "InvalidEventType",
            ErrorKind::MissingSubscription => "MissingSubscription",
            ErrorKind::ConsumerOperationFailed => "ConsumerOperationFailed",
            ErrorKind::InvalidSubscription => "InvalidSubscription",
        };
        f.write_str(name)
    }
}

/// Which broker-side consumer operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOp {
    Lookup,
    Create,
    Update,
    Delete,
}

impl fmt::Display for ConsumerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerOp::Lookup => "lookup",
            ConsumerOp::Create => "create",
            ConsumerOp::Update => "update",
            ConsumerOp::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Error returned by `SyncSubscription` / `DeleteSubscription` and the
/// lifecycle manager.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("broker backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("broker connection lost permanently: {0}")]
    Connection(String),

    #[error("invalid event type {event_type:?}: {reason}")]
    InvalidEventType { event_type: String, reason: String },

    #[error("consumer {consumer} for subject {subject} exists on the broker but is not tracked; delete and recreate the subscription")]
    MissingSubscription { subject: String, consumer: String },

    #[error("consumer {op} failed for {consumer}: {source}")]
    ConsumerOperationFailed {
        op: ConsumerOp,
        consumer: String,
        #[source]
        source: BrokerError,
    },

    #[error("invalid subscription {subscription}: {reason}")]
    InvalidSubscription { subscription: String, reason: String },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            SyncError::Connection(_) => ErrorKind::ConnectionError,
            SyncError::InvalidEventType { .. } => ErrorKind::InvalidEventType,
            SyncError::MissingSubscription { .. } => ErrorKind::MissingSubscription,
            SyncError::ConsumerOperationFailed { .. } => ErrorKind::ConsumerOperationFailed,
            SyncError::InvalidSubscription { .. } => ErrorKind::InvalidSubscription,
        }
    }

    /// Whether a controller should simply re-invoke the operation later.
    ///
    /// `MissingSubscription` is not retryable: it needs an
    /// operator (or the controller) to delete and recreate the subscription.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnavailable | ErrorKind::ConsumerOperationFailed
        )
    }

    pub(crate) fn consumer(op: ConsumerOp, consumer: &str, source: BrokerError) -> Self {
        // a dropped connection mid-operation is an availability problem, not a rejection
        if source.is_connection_issue() {
            return SyncError::BackendUnavailable(format!(
                "consumer {} on {}: {}",
                op, consumer, source
            ));
        }
        SyncError::ConsumerOperationFailed {
            op,
            consumer: consumer.to_string(),
            source,
        }
    }
}

/// Error type of the broker capability interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("not connected to broker")]
    Disconnected,

    #[error("connection closed")]
    Closed,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("consumer already exists: {0}")]
    ConsumerExists(String),

    #[error("no stream accepts subject {0}")]
    NoStreamForSubject(String),

    #[error("stream {0} is full")]
    StreamFull(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("request timed out")]
    Timeout,

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::StreamNotFound(_) | BrokerError::ConsumerNotFound(_)
        )
    }

    pub fn is_connection_issue(&self) -> bool {
        matches!(
            self,
            BrokerError::Disconnected
                | BrokerError::Closed
                | BrokerError::ConnectionRefused(_)
                | BrokerError::Timeout
        )
    }
}

/// Failure of a single delivery attempt to a sink.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("sink responded with status {0}")]
    Status(u16),

    #[error("sink request timed out")]
    Timeout,

    #[error("sink transport error: {0}")]
    Transport(String),

    #[error("invalid sink url {0}")]
    InvalidSink(String),

    #[error("cannot decode event: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::Timeout
        } else if let Some(status) = err.status() {
            DispatchError::Status(status.as_u16())
        } else if err.is_builder() {
            DispatchError::InvalidSink(err.to_string())
        } else {
            DispatchError::Transport(err.to_string())
        }
    }
}
