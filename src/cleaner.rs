//! Event type normalization.
//!
//! Subjects are dot-separated token lists with `*` and `>` as wildcards, so a
//! declared event type has to be reduced to tokens the broker will route
//! literally before it can be embedded in a subject.

use crate::error::SyncError;

/// Normalizes raw event types into subject-safe strings.
pub trait Cleaner: Send + Sync {
    /// Deterministic, side-effect free. Fails with `InvalidEventType` when
    /// nothing routable remains.
    fn clean_event_type(&self, event_type: &str) -> Result<String, SyncError>;
}

/// Cleaner for dot-separated broker subjects.
///
/// Each dot-separated segment keeps ASCII alphanumerics, `-` and `_`; every
/// other character (whitespace, wildcards, punctuation) is dropped. Segments
/// that end up empty are removed, so `"order..created "` cleans to
/// `"order.created"`.
///
/// ```
/// use sourced_sync::cleaner::{Cleaner, SubjectCleaner};
///
/// let cleaner = SubjectCleaner::new();
/// assert_eq!(cleaner.clean_event_type("order.created.v1").unwrap(), "order.created.v1");
/// assert_eq!(cleaner.clean_event_type("Order Created.v1*").unwrap(), "OrderCreated.v1");
/// assert!(cleaner.clean_event_type(" .*. ").is_err());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectCleaner;

impl SubjectCleaner {
    pub fn new() -> Self {
        Self
    }

    fn is_subject_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '-' || c == '_'
    }
}

impl Cleaner for SubjectCleaner {
    fn clean_event_type(&self, event_type: &str) -> Result<String, SyncError> {
        let segments: Vec<String> = event_type
            .split('.')
            .map(|segment| {
                segment
                    .chars()
                    .filter(|c| Self::is_subject_char(*c))
                    .collect::<String>()
            })
            .filter(|segment| !segment.is_empty())
            .collect();

        if segments.is_empty() {
            return Err(SyncError::InvalidEventType {
                event_type: event_type.to_string(),
                reason: "no subject-safe characters remain after cleaning".to_string(),
            });
        }

        Ok(segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn clean(raw: &str) -> Result<String, SyncError> {
        SubjectCleaner::new().clean_event_type(raw)
    }

    #[test]
    fn clean_type_is_unchanged() {
        assert_eq!(clean("order.created.v1").unwrap(), "order.created.v1");
        assert_eq!(clean("order-created_v1").unwrap(), "order-created_v1");
    }

    #[test]
    fn strips_reserved_characters() {
        assert_eq!(clean("order.>").unwrap(), "order");
        assert_eq!(clean("order.*.created").unwrap(), "order.created");
        assert_eq!(clean("  order.created  ").unwrap(), "order.created");
        assert_eq!(clean("prefix.test app.order$created").unwrap(), "prefix.testapp.ordercreated");
    }

    #[test]
    fn collapses_empty_segments() {
        assert_eq!(clean(".order..created.").unwrap(), "order.created");
    }

    #[test]
    fn empty_input_is_rejected() {
        for raw in ["", "   ", "...", "*.>"] {
            let err = clean(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidEventType, "input {raw:?}");
        }
    }

    #[test]
    fn deterministic() {
        let raw = "Sales Order.Created!.v1";
        assert_eq!(clean(raw).unwrap(), clean(raw).unwrap());
    }
}
