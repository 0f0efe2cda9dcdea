use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::handle::ConsumerHandle;
use crate::subject::SubscriptionSubjectIdentifier;
use crate::subscription::SubscriptionKey;

/// Entries of one subscription identity.
#[derive(Default)]
pub(crate) struct Shard {
    pub entries: HashMap<SubscriptionSubjectIdentifier, ConsumerHandle>,
}

/// Bookkeeping table, sharded by subscription identity.
///
/// Each identity gets its own async lock, created lazily, so syncs of
/// different subscriptions never wait on each other while syncs of the same
/// subscription are serialized.
#[derive(Default)]
pub(crate) struct BookkeepingTable {
    shards: Mutex<HashMap<SubscriptionKey, Arc<AsyncMutex<Shard>>>>,
}

impl BookkeepingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock the shard of `key`, creating it if needed.
    pub(crate) async fn lock(&self, key: &SubscriptionKey) -> OwnedMutexGuard<Shard> {
        loop {
            let shard = self
                .shards
                .lock()
                .entry(key.clone())
                .or_default()
                .clone();
            let guard = Arc::clone(&shard).lock_owned().await;
            // the shard may have been dropped from the map while we waited
            if self.is_current(key, &shard) {
                return guard;
            }
        }
    }

    /// Lock the shard of `key` only if it exists.
    pub(crate) async fn lock_existing(
        &self,
        key: &SubscriptionKey,
    ) -> Option<OwnedMutexGuard<Shard>> {
        loop {
            let shard = self.shards.lock().get(key).cloned()?;
            let guard = Arc::clone(&shard).lock_owned().await;
            if self.is_current(key, &shard) {
                return Some(guard);
            }
        }
    }

    /// Drop the shard of `key` from the map when it holds no entries.
    /// Must be called with that shard's guard held.
    pub(crate) fn release_if_empty(&self, key: &SubscriptionKey, guard: &OwnedMutexGuard<Shard>) {
        if guard.entries.is_empty() {
            let mut shards = self.shards.lock();
            if shards
                .get(key)
                .map(|current| Arc::ptr_eq(current, OwnedMutexGuard::mutex(guard)))
                .unwrap_or(false)
            {
                shards.remove(key);
            }
        }
    }

    fn is_current(&self, key: &SubscriptionKey, shard: &Arc<AsyncMutex<Shard>>) -> bool {
        self.shards
            .lock()
            .get(key)
            .map(|current| Arc::ptr_eq(current, shard))
            .unwrap_or(false)
    }

    /// Every shard currently in the table.
    pub(crate) fn shards(&self) -> Vec<(SubscriptionKey, Arc<AsyncMutex<Shard>>)> {
        self.shards
            .lock()
            .iter()
            .map(|(key, shard)| (key.clone(), Arc::clone(shard)))
            .collect()
    }

    pub(crate) async fn len(&self) -> usize {
        let mut total = 0;
        for (_, shard) in self.shards() {
            total += shard.lock().await.entries.len();
        }
        total
    }

    /// Remove every shard, dropping (and thereby stopping) all handles.
    pub(crate) async fn clear(&self) {
        let shards: Vec<_> = self.shards.lock().drain().collect();
        for (_, shard) in shards {
            shard.lock().await.entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let table = Arc::new(BookkeepingTable::new());
        let key = SubscriptionKey::new("ns", "sub");

        let guard = table.lock(&key).await;
        let contender = {
            let table = Arc::clone(&table);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = table.lock(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let table = BookkeepingTable::new();
        let _a = table.lock(&SubscriptionKey::new("ns", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            table.lock(&SubscriptionKey::new("ns", "b")),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn empty_shard_is_released() {
        let table = BookkeepingTable::new();
        let key = SubscriptionKey::new("ns", "sub");

        let guard = table.lock(&key).await;
        table.release_if_empty(&key, &guard);
        drop(guard);

        assert!(table.shards().is_empty());
        assert!(table.lock_existing(&key).await.is_none());
    }

    #[tokio::test]
    async fn waiter_on_released_shard_gets_a_fresh_one() {
        let table = Arc::new(BookkeepingTable::new());
        let key = SubscriptionKey::new("ns", "sub");

        let guard = table.lock(&key).await;
        let waiter = {
            let table = Arc::clone(&table);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = table.lock(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.release_if_empty(&key, &guard);
        drop(guard);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.shards().len(), 1);
    }
}
