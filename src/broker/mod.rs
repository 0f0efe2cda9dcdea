//! Broker capability interface.
//!
//! The engine never talks to a concrete broker client directly. It needs a
//! narrow set of capabilities (durable filtered consumers, explicit acks,
//! stream management) and this module expresses them as traits so any client
//! can be plugged in, or faked in tests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          ConnectionManager / Reconciler / Delivery          │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Connector + BrokerClient Traits                 │
//! │  Connector: connect(url, timeout)                           │
//! │  BrokerClient: streams / consumers / fetch / ack / publish  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────┐                 ┌─────────────────────┐
//! │  InMemoryBroker  │                 │  JetStreamConnector │
//! │   (test fake)    │                 │   (async-nats)      │
//! └──────────────────┘                 └─────────────────────┘
//! ```

mod client;
mod in_memory;
#[cfg(feature = "jetstream")]
mod jetstream;

pub use client::{
    subject_matches, AckPolicy, BrokerClient, BrokerMessage, ConnectionEvent, ConsumerConfig,
    ConsumerInfo, Connector, FetchRequest, StreamConfig, StreamInfo, StreamState,
};
pub use in_memory::{InMemoryBroker, InMemoryClient, InMemoryConnector};
#[cfg(feature = "jetstream")]
pub use jetstream::{JetStreamClient, JetStreamConnector};
