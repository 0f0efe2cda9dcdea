use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::subject::source_violation;

/// Unique identity of a subscription: namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub namespace: String,
    pub name: String,
}

impl SubscriptionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How an event type is turned into a subject segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeMatching {
    /// The type goes through the cleaner first.
    #[default]
    Standard,
    /// The raw type is used verbatim.
    Exact,
}

/// One declared (event type, matching mode) filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypeFilter {
    pub event_type: String,
    pub matching: TypeMatching,
}

impl EventTypeFilter {
    pub fn standard(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            matching: TypeMatching::Standard,
        }
    }

    pub fn exact(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            matching: TypeMatching::Exact,
        }
    }
}

/// Desired state of one subscription.
///
/// ## Example
///
/// ```
/// use sourced_sync::subscription::SubscriptionSpec;
///
/// let spec = SubscriptionSpec::new("default", "orders", "shop", "http://orders.svc/events")
///     .with_type("order.created.v1")
///     .with_exact_type("order.cancelled.v1")
///     .with_max_in_flight(5);
///
/// assert_eq!(spec.types.len(), 2);
/// assert_eq!(spec.key.to_string(), "default/orders");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub key: SubscriptionKey,
    /// Logical event source, embedded in every subject of this subscription.
    pub source: String,
    /// Ordered set of filters. Duplicates collapse onto one consumer.
    pub types: Vec<EventTypeFilter>,
    /// Delivery target URL. Changing it never recreates consumers.
    pub sink: String,
    /// Bound on unacknowledged deliveries per consumer. `None` uses the
    /// process-wide default.
    pub max_in_flight_messages: Option<u32>,
}

impl SubscriptionSpec {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<String>,
        sink: impl Into<String>,
    ) -> Self {
        Self {
            key: SubscriptionKey::new(namespace, name),
            source: source.into(),
            types: Vec::new(),
            sink: sink.into(),
            max_in_flight_messages: None,
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.types.push(EventTypeFilter::standard(event_type));
        self
    }

    pub fn with_exact_type(mut self, event_type: impl Into<String>) -> Self {
        self.types.push(EventTypeFilter::exact(event_type));
        self
    }

    pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = sink.into();
        self
    }

    pub fn with_max_in_flight(mut self, max: u32) -> Self {
        self.max_in_flight_messages = Some(max);
        self
    }

    /// Effective in-flight bound given the process default.
    pub fn max_in_flight_or(&self, default: u32) -> u32 {
        self.max_in_flight_messages.unwrap_or(default)
    }

    /// Structural checks that do not depend on the cleaner.
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |reason: &str| SyncError::InvalidSubscription {
            subscription: self.key.to_string(),
            reason: reason.to_string(),
        };

        if self.key.namespace.is_empty() || self.key.name.is_empty() {
            return Err(invalid("namespace and name must be set"));
        }
        // '/' separates identity parts inside consumer identifiers
        if self.key.namespace.contains('/') || self.key.name.contains('/') {
            return Err(invalid("namespace and name must not contain '/'"));
        }
        if let Some(reason) = source_violation(&self.source) {
            return Err(invalid(reason));
        }
        if self.sink.trim().is_empty() {
            return Err(invalid("sink must not be empty"));
        }
        if self.types.iter().any(|t| t.event_type.trim().is_empty()) {
            return Err(invalid("event types must not be empty"));
        }
        if self.max_in_flight_messages == Some(0) {
            return Err(invalid("max in-flight messages must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn builder_collects_filters_in_order() {
        let spec = SubscriptionSpec::new("ns", "sub", "src", "http://sink")
            .with_type("a.b")
            .with_exact_type("c.d");
        assert_eq!(
            spec.types,
            vec![EventTypeFilter::standard("a.b"), EventTypeFilter::exact("c.d")]
        );
    }

    #[test]
    fn zero_in_flight_is_invalid() {
        let spec = SubscriptionSpec::new("ns", "sub", "src", "http://sink").with_max_in_flight(0);
        assert_eq!(
            spec.validate().unwrap_err().kind(),
            ErrorKind::InvalidSubscription
        );
    }

    #[test]
    fn blank_type_is_invalid() {
        let spec = SubscriptionSpec::new("ns", "sub", "src", "http://sink").with_exact_type(" ");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn wildcard_or_dotted_source_is_invalid() {
        for source in ["*", ">", "shop.eu", "my shop", " "] {
            let spec = SubscriptionSpec::new("ns", "sub", source, "http://sink").with_type("a.b");
            assert_eq!(
                spec.validate().unwrap_err().kind(),
                ErrorKind::InvalidSubscription,
                "{source:?}"
            );
        }
    }

    #[test]
    fn slash_in_identity_is_invalid() {
        let spec = SubscriptionSpec::new("ns/x", "sub", "src", "http://sink");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn default_in_flight_applies_when_unset() {
        let spec = SubscriptionSpec::new("ns", "sub", "src", "http://sink");
        assert_eq!(spec.max_in_flight_or(9), 9);
        assert_eq!(spec.with_max_in_flight(2).max_in_flight_or(9), 2);
    }
}
