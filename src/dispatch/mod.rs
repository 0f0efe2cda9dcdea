//! Dispatch and acknowledgement.
//!
//! Every live consumer runs one delivery loop:
//!
//! ```text
//!   fetch (bounded by PendingLimits)
//!        │
//!        ▼
//!   EventEnvelope::decode ──── undecodable ───▶ term
//!        │
//!        ▼
//!   Sink::deliver(current target)
//!        │
//!   2xx ─┴─▶ ack          failure ─▶ no ack, broker redelivers after ack_wait
//! ```
//!
//! Messages of one consumer are dispatched one at a time in fetch order.
//! Delivery is at-least-once: a sink may see duplicates.

mod envelope;
mod pipeline;
mod sink;

pub use envelope::{EventEnvelope, CONTENT_TYPE_HEADER, HEADER_PREFIX, SPEC_VERSION};
pub(crate) use pipeline::{Delivery, StatsCounter};
pub use pipeline::{DeliveryStats, PendingLimits};
pub use sink::{HttpSink, Sink};
