use std::collections::HashSet;
use std::sync::Arc;

use crate::broker::{AckPolicy, BrokerClient, ConsumerConfig, Connector};
use crate::cleaner::Cleaner;
use crate::config::SubscriptionDefaults;
use crate::connection::{with_timeout, ConnectionManager};
use crate::dispatch::{DeliveryStats, PendingLimits, Sink};
use crate::error::{ConsumerOp, SyncError};
use crate::subject::{SubjectBuilder, SubscriptionSubjectIdentifier};
use crate::subscription::{
    EventTypeStatus, StatusSink, SubscriptionKey, SubscriptionSpec, TypeMatching,
};

use super::handle::{BindOptions, ConsumerHandle};
use super::table::{BookkeepingTable, Shard};

/// Hex SHA-256 digests: the only consumer names this engine ever creates.
const CONSUMER_NAME_LEN: usize = 64;

/// Converges broker consumers and local delivery loops onto declared
/// subscriptions.
///
/// ## Example
///
/// ```ignore
/// let connection = Arc::new(ConnectionManager::new(broker.connector(), settings.broker.clone()));
/// connection.initialize().await?;
///
/// let reconciler = Reconciler::new(
///     connection,
///     Arc::new(SubjectCleaner::new()),
///     Arc::new(HttpSink::new(settings.subscriptions.dispatch_timeout)?),
///     settings.subscriptions.clone(),
/// )
/// .with_status_sink(status_store.clone());
///
/// reconciler.sync_subscription(&spec).await?;
/// ```
pub struct Reconciler<K: Connector> {
    connection: Arc<ConnectionManager<K>>,
    subjects: SubjectBuilder,
    sink: Arc<dyn Sink>,
    defaults: SubscriptionDefaults,
    status: Option<Arc<dyn StatusSink>>,
    table: BookkeepingTable,
}

impl<K: Connector> Reconciler<K> {
    pub fn new(
        connection: Arc<ConnectionManager<K>>,
        cleaner: Arc<dyn Cleaner>,
        sink: Arc<dyn Sink>,
        defaults: SubscriptionDefaults,
    ) -> Self {
        let subjects = SubjectBuilder::new(connection.config().subject_prefix.clone(), cleaner);
        Self {
            connection,
            subjects,
            sink,
            defaults,
            status: None,
            table: BookkeepingTable::new(),
        }
    }

    /// Report cleaned event types of every sync to `status`.
    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<K>> {
        &self.connection
    }

    pub fn subjects(&self) -> &SubjectBuilder {
        &self.subjects
    }

    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.connection.initialize().await
    }

    /// Broker subject for a source and a declared type.
    pub fn get_subject(
        &self,
        source: &str,
        event_type: &str,
        matching: TypeMatching,
    ) -> Result<String, SyncError> {
        self.subjects.subject(source, event_type, matching)
    }

    /// Identifiers derivable from `spec`, in declaration order, duplicates removed.
    pub fn identifiers(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<Vec<SubscriptionSubjectIdentifier>, SyncError> {
        Ok(self.desired(spec)?.0)
    }

    fn desired(
        &self,
        spec: &SubscriptionSpec,
    ) -> Result<(Vec<SubscriptionSubjectIdentifier>, Vec<EventTypeStatus>), SyncError> {
        let mut ids = Vec::with_capacity(spec.types.len());
        let mut statuses = Vec::with_capacity(spec.types.len());
        let mut seen = HashSet::new();
        for filter in &spec.types {
            let segment = self.subjects.type_segment(filter)?;
            let subject = self.subjects.join(&spec.source, &segment);
            statuses.push(EventTypeStatus {
                original_type: filter.event_type.clone(),
                clean_type: segment,
            });
            let id = SubscriptionSubjectIdentifier::new(&spec.key, &subject);
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
        Ok((ids, statuses))
    }

    /// Bring broker consumers and local delivery loops in line with `spec`.
    ///
    /// Existing consumers are never recreated for sink or in-flight changes.
    /// Returns the first error; whatever completed before it stays applied.
    pub async fn sync_subscription(&self, spec: &SubscriptionSpec) -> Result<(), SyncError> {
        spec.validate()?;
        let (desired, statuses) = self.desired(spec)?;
        if let Some(status) = &self.status {
            status.record_types(&spec.key, statuses);
        }

        let (client, epoch) = self.connection.ensure_ready().await?;
        let max_in_flight = spec.max_in_flight_or(self.defaults.max_in_flight_messages);

        let mut shard = self.table.lock(&spec.key).await;
        let result = self
            .apply(&client, epoch, &mut shard, spec, &desired, max_in_flight)
            .await;
        self.table.release_if_empty(&spec.key, &shard);

        match &result {
            Ok(()) => tracing::debug!(
                subscription = %spec.key,
                consumers = shard.entries.len(),
                "subscription synced"
            ),
            Err(err) => tracing::warn!(
                subscription = %spec.key,
                kind = %err.kind(),
                error = %err,
                "subscription sync failed"
            ),
        }
        result
    }

    async fn apply(
        &self,
        client: &K::Client,
        epoch: u64,
        shard: &mut Shard,
        spec: &SubscriptionSpec,
        desired: &[SubscriptionSubjectIdentifier],
        max_in_flight: u32,
    ) -> Result<(), SyncError> {
        for id in desired {
            self.sync_identifier(client, epoch, shard, id, spec, max_in_flight)
                .await?;
        }

        let wanted: HashSet<&SubscriptionSubjectIdentifier> = desired.iter().collect();
        let stale: Vec<SubscriptionSubjectIdentifier> = shard
            .entries
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        for id in stale {
            self.delete_consumer(client, &id).await?;
            shard.entries.remove(&id);
            tracing::info!(
                subscription = %spec.key,
                subject = %id.subject(),
                consumer = %id.consumer_name(),
                "consumer removed for dropped filter"
            );
        }
        Ok(())
    }

    async fn sync_identifier(
        &self,
        client: &K::Client,
        epoch: u64,
        shard: &mut Shard,
        id: &SubscriptionSubjectIdentifier,
        spec: &SubscriptionSpec,
        max_in_flight: u32,
    ) -> Result<(), SyncError> {
        let stream = self.stream_name();
        let timeout = self.connection.config().request_timeout;

        let tracked_live = match shard.entries.get(id) {
            None => None,
            Some(handle) => Some(handle.is_live(epoch)),
        };

        match tracked_live {
            None => {
                match with_timeout(timeout, client.consumer_info(stream, id.consumer_name())).await
                {
                    Ok(_) => {
                        tracing::error!(
                            subscription = %spec.key,
                            subject = %id.subject(),
                            consumer = %id.consumer_name(),
                            "consumer exists on the broker but is not tracked"
                        );
                        Err(SyncError::MissingSubscription {
                            subject: id.subject().to_string(),
                            consumer: id.consumer_name().to_string(),
                        })
                    }
                    Err(err) if err.is_not_found() => {
                        let config = self.consumer_config(id, max_in_flight);
                        with_timeout(timeout, client.create_consumer(stream, config))
                            .await
                            .map_err(|e| SyncError::consumer(ConsumerOp::Create, id.consumer_name(), e))?;
                        let handle = self.bind(client, epoch, id, spec, max_in_flight, None);
                        shard.entries.insert(id.clone(), handle);
                        tracing::info!(
                            subscription = %spec.key,
                            subject = %id.subject(),
                            consumer = %id.consumer_name(),
                            max_in_flight,
                            "consumer created"
                        );
                        Ok(())
                    }
                    Err(err) => Err(SyncError::consumer(
                        ConsumerOp::Lookup,
                        id.consumer_name(),
                        err,
                    )),
                }
            }
            Some(true) => {
                let info = with_timeout(timeout, client.consumer_info(stream, id.consumer_name()))
                    .await;
                match info {
                    Ok(info) => {
                        if self.needs_update(&info.config, max_in_flight) {
                            let config = ConsumerConfig {
                                max_ack_pending: max_in_flight,
                                ack_wait: self.connection.config().ack_wait,
                                ..info.config
                            };
                            with_timeout(timeout, client.update_consumer(stream, config))
                                .await
                                .map_err(|e| {
                                    SyncError::consumer(ConsumerOp::Update, id.consumer_name(), e)
                                })?;
                            tracing::info!(
                                subscription = %spec.key,
                                consumer = %id.consumer_name(),
                                max_in_flight,
                                "consumer limits updated"
                            );
                        }
                        if let Some(handle) = shard.entries.get_mut(id) {
                            handle.set_sink_target(&spec.sink);
                            handle.set_max_in_flight(max_in_flight);
                        }
                        Ok(())
                    }
                    Err(err) if err.is_not_found() => {
                        tracing::warn!(
                            subscription = %spec.key,
                            consumer = %id.consumer_name(),
                            "tracked consumer vanished from the broker, rebinding"
                        );
                        self.rebind(client, epoch, shard, id, spec, max_in_flight)
                            .await
                    }
                    Err(err) => Err(SyncError::consumer(
                        ConsumerOp::Lookup,
                        id.consumer_name(),
                        err,
                    )),
                }
            }
            Some(false) => {
                self.rebind(client, epoch, shard, id, spec, max_in_flight)
                    .await
            }
        }
    }

    /// Re-attach a tracked identifier: reuse its consumer if the broker kept
    /// it, recreate it otherwise, and start a fresh delivery loop.
    async fn rebind(
        &self,
        client: &K::Client,
        epoch: u64,
        shard: &mut Shard,
        id: &SubscriptionSubjectIdentifier,
        spec: &SubscriptionSpec,
        max_in_flight: u32,
    ) -> Result<(), SyncError> {
        let stream = self.stream_name();
        let timeout = self.connection.config().request_timeout;

        let reused = match with_timeout(timeout, client.consumer_info(stream, id.consumer_name()))
            .await
        {
            Ok(info) => {
                if self.needs_update(&info.config, max_in_flight) {
                    let config = ConsumerConfig {
                        max_ack_pending: max_in_flight,
                        ack_wait: self.connection.config().ack_wait,
                        ..info.config
                    };
                    with_timeout(timeout, client.update_consumer(stream, config))
                        .await
                        .map_err(|e| SyncError::consumer(ConsumerOp::Update, id.consumer_name(), e))?;
                }
                true
            }
            Err(err) if err.is_not_found() => {
                let config = self.consumer_config(id, max_in_flight);
                with_timeout(timeout, client.create_consumer(stream, config))
                    .await
                    .map_err(|e| SyncError::consumer(ConsumerOp::Create, id.consumer_name(), e))?;
                false
            }
            Err(err) => {
                return Err(SyncError::consumer(
                    ConsumerOp::Lookup,
                    id.consumer_name(),
                    err,
                ))
            }
        };

        let limits = shard.entries.get(id).map(ConsumerHandle::pending_limits);
        let handle = self.bind(client, epoch, id, spec, max_in_flight, limits);
        // replacing the old handle stops its loop
        shard.entries.insert(id.clone(), handle);
        tracing::info!(
            subscription = %spec.key,
            subject = %id.subject(),
            consumer = %id.consumer_name(),
            reused,
            epoch,
            "consumer rebound"
        );
        Ok(())
    }

    fn bind(
        &self,
        client: &K::Client,
        epoch: u64,
        id: &SubscriptionSubjectIdentifier,
        spec: &SubscriptionSpec,
        max_in_flight: u32,
        limits: Option<PendingLimits>,
    ) -> ConsumerHandle {
        ConsumerHandle::bind(
            id,
            client.clone(),
            epoch,
            Arc::clone(&self.sink),
            BindOptions {
                stream: self.stream_name().to_string(),
                sink_target: spec.sink.clone(),
                max_in_flight,
                limits: limits.unwrap_or_else(|| PendingLimits::from(&self.defaults)),
                fetch_wait: self.defaults.fetch_wait,
            },
        )
    }

    fn consumer_config(&self, id: &SubscriptionSubjectIdentifier, max_in_flight: u32) -> ConsumerConfig {
        let broker = self.connection.config();
        ConsumerConfig {
            durable_name: id.consumer_name().to_string(),
            filter_subject: id.subject().to_string(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: broker.ack_wait,
            max_ack_pending: max_in_flight,
            deliver_policy: broker.deliver_policy,
        }
    }

    fn needs_update(&self, current: &ConsumerConfig, max_in_flight: u32) -> bool {
        current.max_ack_pending != max_in_flight
            || current.ack_wait != self.connection.config().ack_wait
    }

    fn stream_name(&self) -> &str {
        &self.connection.stream_config().name
    }

    async fn delete_consumer(
        &self,
        client: &K::Client,
        id: &SubscriptionSubjectIdentifier,
    ) -> Result<(), SyncError> {
        let timeout = self.connection.config().request_timeout;
        match with_timeout(
            timeout,
            client.delete_consumer(self.stream_name(), id.consumer_name()),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(SyncError::consumer(ConsumerOp::Delete, id.consumer_name(), err)),
        }
    }

    /// Delete every consumer tracked for `spec`'s identity.
    ///
    /// Idempotent. Entries whose deletion failed stay tracked for the next
    /// attempt; the first failure is returned.
    pub async fn delete_subscription(&self, spec: &SubscriptionSpec) -> Result<(), SyncError> {
        let Some(mut shard) = self.table.lock_existing(&spec.key).await else {
            self.clear_status(&spec.key);
            return Ok(());
        };
        if shard.entries.is_empty() {
            self.table.release_if_empty(&spec.key, &shard);
            self.clear_status(&spec.key);
            return Ok(());
        }

        let (client, _) = self.connection.ensure_ready().await?;
        let ids: Vec<SubscriptionSubjectIdentifier> = shard.entries.keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            match self.delete_consumer(&client, &id).await {
                Ok(()) => {
                    shard.entries.remove(&id);
                    tracing::info!(
                        subscription = %spec.key,
                        subject = %id.subject(),
                        consumer = %id.consumer_name(),
                        "consumer deleted"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        subscription = %spec.key,
                        consumer = %id.consumer_name(),
                        error = %err,
                        "consumer deletion failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        self.table.release_if_empty(&spec.key, &shard);

        match first_error {
            Some(err) => Err(err),
            None => {
                self.clear_status(&spec.key);
                Ok(())
            }
        }
    }

    fn clear_status(&self, key: &SubscriptionKey) {
        if let Some(status) = &self.status {
            status.clear(key);
        }
    }

    /// Delete engine-created consumers in the stream that no identifier of
    /// `specs` (nor any tracked entry) accounts for. Returns the deleted names.
    ///
    /// Consumers named by other clients are left alone.
    pub async fn delete_orphaned_consumers(
        &self,
        specs: &[SubscriptionSpec],
    ) -> Result<Vec<String>, SyncError> {
        let (client, _) = self.connection.ensure_ready().await?;

        let mut known: HashSet<String> = HashSet::new();
        for spec in specs {
            // a spec with an uncleanable type cannot own a consumer for it
            for filter in &spec.types {
                if let Ok(segment) = self.subjects.type_segment(filter) {
                    let subject = self.subjects.join(&spec.source, &segment);
                    known.insert(
                        SubscriptionSubjectIdentifier::new(&spec.key, &subject)
                            .consumer_name()
                            .to_string(),
                    );
                }
            }
        }
        for (_, shard) in self.table.shards() {
            let shard = shard.lock().await;
            known.extend(shard.entries.keys().map(|id| id.consumer_name().to_string()));
        }

        let timeout = self.connection.config().request_timeout;
        let names = with_timeout(timeout, client.list_consumers(self.stream_name()))
            .await
            .map_err(|e| SyncError::consumer(ConsumerOp::Lookup, self.stream_name(), e))?;

        let mut deleted = Vec::new();
        for name in names {
            if known.contains(&name) || !is_generated_consumer_name(&name) {
                continue;
            }
            match with_timeout(timeout, client.delete_consumer(self.stream_name(), &name)).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(SyncError::consumer(ConsumerOp::Delete, &name, err)),
            }
            tracing::info!(consumer = %name, "orphaned consumer deleted");
            deleted.push(name);
        }
        Ok(deleted)
    }

    async fn with_handle<T>(
        &self,
        id: &SubscriptionSubjectIdentifier,
        f: impl FnOnce(&ConsumerHandle) -> T,
    ) -> Option<T> {
        let shard = self.table.lock_existing(id.key()).await?;
        shard.entries.get(id).map(f)
    }

    /// Total number of tracked consumers.
    pub async fn consumer_count(&self) -> usize {
        self.table.len().await
    }

    pub async fn consumer_count_for(&self, key: &SubscriptionKey) -> usize {
        match self.table.lock_existing(key).await {
            Some(shard) => shard.entries.len(),
            None => 0,
        }
    }

    /// Tracked identifiers of one subscription, sorted.
    pub async fn identifiers_for(&self, key: &SubscriptionKey) -> Vec<SubscriptionSubjectIdentifier> {
        let mut ids: Vec<_> = match self.table.lock_existing(key).await {
            Some(shard) => shard.entries.keys().cloned().collect(),
            None => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Whether `id` is tracked and its delivery loop runs on the current connection.
    pub async fn is_live(&self, id: &SubscriptionSubjectIdentifier) -> bool {
        let epoch = self.connection.epoch();
        self.with_handle(id, |h| h.is_live(epoch))
            .await
            .unwrap_or(false)
    }

    /// Sink URL the delivery loop of `id` currently posts to.
    pub async fn sink_for(&self, id: &SubscriptionSubjectIdentifier) -> Option<String> {
        self.with_handle(id, ConsumerHandle::sink_target).await
    }

    pub async fn max_in_flight_for(&self, id: &SubscriptionSubjectIdentifier) -> Option<u32> {
        self.with_handle(id, ConsumerHandle::max_in_flight).await
    }

    pub async fn pending_limits(&self, id: &SubscriptionSubjectIdentifier) -> Option<PendingLimits> {
        self.with_handle(id, ConsumerHandle::pending_limits).await
    }

    /// Change the fetch caps of a tracked consumer. Returns false if `id` is
    /// not tracked.
    pub async fn set_pending_limits(
        &self,
        id: &SubscriptionSubjectIdentifier,
        limits: PendingLimits,
    ) -> bool {
        self.with_handle(id, |h| h.set_pending_limits(limits))
            .await
            .is_some()
    }

    pub async fn delivery_stats(&self, id: &SubscriptionSubjectIdentifier) -> Option<DeliveryStats> {
        self.with_handle(id, ConsumerHandle::stats).await
    }

    /// Drop the local entry of `id` without touching the broker.
    ///
    /// The next sync of its subscription then fails with
    /// `MissingSubscription` while the broker consumer exists.
    pub async fn untrack(&self, id: &SubscriptionSubjectIdentifier) -> bool {
        let Some(mut shard) = self.table.lock_existing(id.key()).await else {
            return false;
        };
        let removed = shard.entries.remove(id).is_some();
        self.table.release_if_empty(id.key(), &shard);
        if removed {
            tracing::warn!(subscription = %id.key(), consumer = %id.consumer_name(), "entry untracked");
        }
        removed
    }

    /// Stop every delivery loop. Broker consumers are kept.
    pub async fn shutdown(&self) {
        let count = self.table.len().await;
        self.table.clear().await;
        tracing::info!(consumers = count, "reconciler shut down");
    }
}

fn is_generated_consumer_name(name: &str) -> bool {
    name.len() == CONSUMER_NAME_LEN && name.chars().all(|c| c.is_ascii_hexdigit())
}
