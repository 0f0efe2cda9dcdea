//! Subscription reconciliation.
//!
//! [`Reconciler::sync_subscription`] turns one declared subscription into a
//! set of durable broker consumers, one per distinct subject, each with a
//! local delivery loop:
//!
//! ```text
//!   SubscriptionSpec
//!        │ clean types, derive subjects + identifiers
//!        ▼
//!   desired ids ──────────┐
//!                         ▼
//!   bookkeeping shard (locked per subscription)
//!        │
//!        ├─ tracked + live      → update sink / max_ack_pending in place
//!        ├─ tracked, not live   → reuse or recreate consumer, rebind loop
//!        ├─ untracked, on broker→ MissingSubscription
//!        ├─ untracked, absent   → create consumer, bind loop
//!        └─ tracked, not desired→ delete consumer
//! ```
//!
//! Consumers found on the broker without a local entry are never adopted.

mod engine;
mod handle;
mod table;

pub use engine::Reconciler;
