//! Subscription synchronization engine.
//!
//! Reconciles declared event subscriptions with durable, ack-based consumers
//! on a persistent-stream broker and delivers matching events to HTTP sinks.
//!
//! The main entry points are [`ConnectionManager`] (broker connection and
//! stream lifecycle) and [`Reconciler`] (per-subscription consumer sync and
//! delivery loops). `JetStreamConnector` (feature `jetstream`) talks to a
//! NATS JetStream server; [`InMemoryBroker`] stands in for it in tests.

#[cfg(feature = "http")]
pub mod admin;
pub mod broker;
pub mod cleaner;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod reconciler;
pub mod subject;
pub mod subscription;

pub use broker::{BrokerClient, Connector, InMemoryBroker, InMemoryConnector};
#[cfg(feature = "jetstream")]
pub use broker::{JetStreamClient, JetStreamConnector};
pub use cleaner::{Cleaner, SubjectCleaner};
pub use config::{BrokerConfig, Settings, SubscriptionDefaults};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::{DeliveryStats, EventEnvelope, HttpSink, PendingLimits, Sink};
pub use error::{BrokerError, DispatchError, ErrorKind, SyncError};
pub use reconciler::Reconciler;
pub use subject::{SubjectBuilder, SubscriptionSubjectIdentifier};
pub use subscription::{
    EventTypeStatus, InMemoryStatusStore, StatusSink, SubscriptionKey, SubscriptionSpec,
    TypeMatching,
};
