//! Subscription sync integration tests.
//!
//! Drives the reconciler against the in-memory broker with a real HTTP sink.

mod support;
mod delivery;
mod reconcile;
mod restart;
