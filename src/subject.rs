//! Subject and consumer-identifier derivation.
//!
//! Both are pure functions of their inputs: recomputing them after a process
//! restart yields the same values, which is what lets the engine find its own
//! durable consumers again.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cleaner::Cleaner;
use crate::error::SyncError;
use crate::subscription::{EventTypeFilter, SubscriptionKey, TypeMatching};

const SUBJECT_SEPARATOR: &str = ".";
const IDENTITY_SEPARATOR: &str = "/";

/// Builds broker subjects of the form `<prefix>.<source>.<type>`.
#[derive(Clone)]
pub struct SubjectBuilder {
    prefix: String,
    cleaner: Arc<dyn Cleaner>,
}

impl SubjectBuilder {
    pub fn new(prefix: impl Into<String>, cleaner: Arc<dyn Cleaner>) -> Self {
        Self {
            prefix: prefix.into(),
            cleaner,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The type segment used for `filter`: cleaned for Standard, raw for Exact.
    pub fn type_segment(&self, filter: &EventTypeFilter) -> Result<String, SyncError> {
        match filter.matching {
            TypeMatching::Standard => self.cleaner.clean_event_type(&filter.event_type),
            TypeMatching::Exact => match exact_type_violation(&filter.event_type) {
                None => Ok(filter.event_type.clone()),
                Some(reason) => Err(SyncError::InvalidEventType {
                    event_type: filter.event_type.clone(),
                    reason: reason.to_string(),
                }),
            },
        }
    }

    /// Full subject for a source and a declared type.
    pub fn subject(
        &self,
        source: &str,
        event_type: &str,
        matching: TypeMatching,
    ) -> Result<String, SyncError> {
        if let Some(reason) = source_violation(source) {
            return Err(SyncError::InvalidSubscription {
                subscription: format!("source {source:?}"),
                reason: reason.to_string(),
            });
        }
        let segment = self.type_segment(&EventTypeFilter {
            event_type: event_type.to_string(),
            matching,
        })?;
        Ok(self.join(source, &segment))
    }

    /// Subject from an already-resolved type segment.
    pub fn join(&self, source: &str, type_segment: &str) -> String {
        [self.prefix.as_str(), source, type_segment].join(SUBJECT_SEPARATOR)
    }

    /// Subjects the stream must capture so every built subject lands in it.
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![prefix_wildcard(&self.prefix)]
    }
}

/// Why `source` cannot serve as exactly one literal subject token.
pub(crate) fn source_violation(source: &str) -> Option<&'static str> {
    if source.is_empty() {
        return Some("source must not be empty");
    }
    if source.contains(SUBJECT_SEPARATOR) {
        return Some("source must be a single subject token");
    }
    if source.chars().any(is_reserved) {
        return Some("source must not contain wildcards or whitespace");
    }
    None
}

/// Exact types go into subjects verbatim, so they must already be literal.
fn exact_type_violation(event_type: &str) -> Option<&'static str> {
    if event_type.split(SUBJECT_SEPARATOR).any(str::is_empty) {
        return Some("exact type contains an empty subject token");
    }
    if event_type.chars().any(is_reserved) {
        return Some("exact type must not contain wildcards or whitespace");
    }
    None
}

fn is_reserved(c: char) -> bool {
    c == '*' || c == '>' || c.is_whitespace()
}

/// Subject pattern matching everything below `prefix`.
pub fn prefix_wildcard(prefix: &str) -> String {
    format!("{}{}>", prefix, SUBJECT_SEPARATOR)
}

impl fmt::Debug for SubjectBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectBuilder")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Stable identifier of one (subscription, subject) pair.
///
/// Serves as the bookkeeping key and, via [`consumer_name`](Self::consumer_name),
/// as the broker's durable consumer name. The consumer name is the hex SHA-256
/// of `namespace/name/subject`, which is fixed-length and free of subject
/// separators and wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionSubjectIdentifier {
    key: SubscriptionKey,
    subject: String,
    consumer_name: String,
}

impl SubscriptionSubjectIdentifier {
    pub fn new(key: &SubscriptionKey, subject: &str) -> Self {
        let namespaced = namespaced_subject(key, subject);
        let digest = Sha256::digest(namespaced.as_bytes());
        Self {
            key: key.clone(),
            subject: subject.to_string(),
            consumer_name: hex::encode(digest),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// `namespace/name/subject`, handy for logs.
    pub fn namespaced_subject(&self) -> String {
        namespaced_subject(&self.key, &self.subject)
    }
}

impl fmt::Display for SubscriptionSubjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.namespaced_subject(), self.consumer_name)
    }
}

fn namespaced_subject(key: &SubscriptionKey, subject: &str) -> String {
    [key.namespace.as_str(), key.name.as_str(), subject].join(IDENTITY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaner::SubjectCleaner;
    use crate::error::ErrorKind;

    fn builder() -> SubjectBuilder {
        SubjectBuilder::new("events", Arc::new(SubjectCleaner::new()))
    }

    #[test]
    fn standard_subject_is_cleaned() {
        let subject = builder()
            .subject("shop", "order.created*.v1", TypeMatching::Standard)
            .unwrap();
        assert_eq!(subject, "events.shop.order.created.v1");
    }

    #[test]
    fn exact_subject_keeps_raw_type() {
        let subject = builder()
            .subject("shop", "Order-Created.v1", TypeMatching::Exact)
            .unwrap();
        assert_eq!(subject, "events.shop.Order-Created.v1");
    }

    #[test]
    fn exact_types_must_be_literal() {
        for raw in ["order.*", "order.>", "order created", "order..created", ""] {
            let err = builder()
                .subject("shop", raw, TypeMatching::Exact)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidEventType, "{raw:?}");
        }
    }

    #[test]
    fn source_must_be_one_literal_token() {
        for source in ["*", ">", "shop.eu", "my shop", ""] {
            let err = builder()
                .subject(source, "order.created", TypeMatching::Standard)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSubscription, "{source:?}");
        }
    }

    #[test]
    fn stream_subjects_cover_prefix() {
        assert_eq!(builder().stream_subjects(), vec!["events.>".to_string()]);
    }

    #[test]
    fn identifier_is_deterministic() {
        let key = SubscriptionKey::new("ns", "sub");
        let a = SubscriptionSubjectIdentifier::new(&key, "events.shop.order.created");
        let b = SubscriptionSubjectIdentifier::new(&key, "events.shop.order.created");
        assert_eq!(a, b);
        assert_eq!(a.consumer_name(), b.consumer_name());
        assert_eq!(a.consumer_name().len(), 64);
        assert!(a
            .consumer_name()
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identifiers_differ_per_subscription_and_subject() {
        let subject = "events.shop.order.created";
        let a = SubscriptionSubjectIdentifier::new(&SubscriptionKey::new("ns", "sub-1"), subject);
        let b = SubscriptionSubjectIdentifier::new(&SubscriptionKey::new("ns", "sub-2"), subject);
        let c = SubscriptionSubjectIdentifier::new(
            &SubscriptionKey::new("ns", "sub-1"),
            "events.shop.order.deleted",
        );
        assert_ne!(a.consumer_name(), b.consumer_name());
        assert_ne!(a.consumer_name(), c.consumer_name());
    }

    #[test]
    fn namespace_and_name_boundaries_do_not_collide() {
        let a = SubscriptionSubjectIdentifier::new(&SubscriptionKey::new("ab", "c"), "s");
        let b = SubscriptionSubjectIdentifier::new(&SubscriptionKey::new("a", "bc"), "s");
        assert_ne!(a.consumer_name(), b.consumer_name());
    }
}
