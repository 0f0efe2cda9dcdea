//! Declared subscription state as read from the declarative-resource layer.
//!
//! The engine never mutates a [`SubscriptionSpec`]; it only writes the
//! cleaned event types back through a [`StatusSink`].

mod spec;
mod status;

pub use spec::{EventTypeFilter, SubscriptionKey, SubscriptionSpec, TypeMatching};
pub use status::{EventTypeStatus, InMemoryStatusStore, StatusSink};
