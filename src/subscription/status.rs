use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::SubscriptionKey;

/// Cleaned form of one declared event type, written back for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeStatus {
    pub original_type: String,
    pub clean_type: String,
}

/// Receiver of the cleaned-type results of a sync.
///
/// Persistence is owned by the declarative-resource layer; the engine only
/// reports.
pub trait StatusSink: Send + Sync {
    fn record_types(&self, key: &SubscriptionKey, types: Vec<EventTypeStatus>);

    fn clear(&self, key: &SubscriptionKey);
}

/// Status sink that keeps the latest report per subscription in memory.
#[derive(Default)]
pub struct InMemoryStatusStore {
    types: RwLock<HashMap<SubscriptionKey, Vec<EventTypeStatus>>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&self, key: &SubscriptionKey) -> Option<Vec<EventTypeStatus>> {
        self.types.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }
}

impl StatusSink for InMemoryStatusStore {
    fn record_types(&self, key: &SubscriptionKey, types: Vec<EventTypeStatus>) {
        self.types.write().insert(key.clone(), types);
    }

    fn clear(&self, key: &SubscriptionKey) {
        self.types.write().remove(key);
    }
}
