//! In-memory broker for testing and single-process scenarios.
//!
//! Implements the full capability interface with the semantics the engine
//! relies on: durable filtered consumers, explicit acknowledgement,
//! `max_ack_pending`, redelivery after `ack_wait`, retention and discard
//! policies, and storage-dependent restart behaviour.
//!
//! The broker is a "server" that can be shut down and started again:
//!
//! - File-backed streams (messages, consumers, ack state) are encoded with
//!   bitcode on shutdown and restored on start.
//! - Memory-backed streams are gone after a restart.
//! - Connected clients see [`ConnectionEvent::Disconnected`] on shutdown and
//!   stay disconnected until they call `reconnect()` against a running server.
//!
//! ## Example
//!
//! ```
//! use sourced_sync::broker::{BrokerClient, Connector, InMemoryBroker};
//! use std::time::Duration;
//!
//! # tokio_test();
//! # fn tokio_test() {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let broker = InMemoryBroker::new();
//! let client = broker
//!     .connector()
//!     .connect("memory://local", Duration::from_secs(1))
//!     .await
//!     .unwrap();
//! assert!(client.is_connected());
//!
//! broker.shutdown();
//! assert!(!client.is_connected());
//! # });
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::client::{
    message_size, subject_matches, AckPolicy, BrokerClient, BrokerMessage, ConnectionEvent,
    ConsumerConfig, ConsumerInfo, Connector, FetchRequest, StreamConfig, StreamInfo, StreamState,
};
use crate::config::{DeliverPolicy, DiscardPolicy, RetentionPolicy, StorageType};
use crate::error::BrokerError;

const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// An in-process broker server.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct InMemoryBroker {
    server: Arc<Server>,
}

struct Server {
    state: Mutex<ServerState>,
}

struct ServerState {
    running: bool,
    streams: HashMap<String, StreamData>,
    /// bitcode-encoded File streams while the server is down
    disk: HashMap<String, Vec<u8>>,
    links: Vec<Weak<Link>>,
}

#[derive(Serialize, Deserialize)]
struct StreamData {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    consumers: BTreeMap<String, ConsumerData>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
}

impl StoredMessage {
    fn size(&self) -> usize {
        message_size(&self.subject, &self.payload, &self.headers)
    }
}

#[derive(Serialize, Deserialize)]
struct ConsumerData {
    config: ConsumerConfig,
    /// Next never-delivered sequence to look at.
    next_sequence: u64,
    acked: BTreeSet<u64>,
    delivery_counts: BTreeMap<u64, u32>,
    delivered: u64,
    /// Outstanding deliveries and their redelivery deadline. Not persisted:
    /// after a restart every unacknowledged message is due again.
    #[serde(skip)]
    pending: BTreeMap<u64, Instant>,
}

impl ConsumerData {
    fn is_unacked_due(&self, sequence: u64) -> bool {
        !self.acked.contains(&sequence)
            && sequence < self.next_sequence
            && !self.pending.contains_key(&sequence)
    }
}

/// Per-client connection state shared with the server.
struct Link {
    connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Link {
    fn notify(&self, event: ConnectionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A running broker. File streams survive restarts, Memory streams do not.
    pub fn new() -> Self {
        let broker = Self {
            server: Arc::new(Server {
                state: Mutex::new(ServerState {
                    running: false,
                    streams: HashMap::new(),
                    disk: HashMap::new(),
                    links: Vec::new(),
                }),
            }),
        };
        broker.start();
        broker
    }

    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.server.state.lock().running
    }

    /// Stop the server: persist File streams, drop Memory streams and
    /// disconnect every client.
    pub fn shutdown(&self) {
        let mut state = self.server.state.lock();
        if !state.running {
            return;
        }
        state.running = false;

        let streams: Vec<(String, StreamData)> = state.streams.drain().collect();
        for (name, stream) in streams {
            if stream.config.storage != StorageType::File {
                continue;
            }
            match bitcode::serialize(&stream) {
                Ok(bytes) => {
                    state.disk.insert(name, bytes);
                }
                Err(err) => {
                    tracing::error!(stream = %name, error = %err, "failed to encode stream");
                }
            }
        }

        state.links.retain(|link| link.strong_count() > 0);
        for link in state.links.iter().filter_map(Weak::upgrade) {
            if link.connected.swap(false, Ordering::SeqCst) {
                link.notify(ConnectionEvent::Disconnected);
            }
        }
        tracing::info!("in-memory broker stopped");
    }

    /// Start the server and restore persisted File streams.
    pub fn start(&self) {
        let mut state = self.server.state.lock();
        if state.running {
            return;
        }

        let encoded: Vec<(String, Vec<u8>)> = state.disk.drain().collect();
        for (name, bytes) in encoded {
            match bitcode::deserialize::<StreamData>(&bytes) {
                Ok(stream) => {
                    state.streams.insert(name, stream);
                }
                Err(err) => {
                    tracing::error!(stream = %name, error = %err, "failed to restore stream");
                }
            }
        }

        state.running = true;
        tracing::info!(streams = state.streams.len(), "in-memory broker started");
    }

    /// Stop and start again.
    pub fn restart(&self) {
        self.shutdown();
        self.start();
    }

    fn register(&self) -> Result<Arc<Link>, BrokerError> {
        let mut state = self.server.state.lock();
        if !state.running {
            return Err(BrokerError::ConnectionRefused(
                "broker is not running".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(16);
        let link = Arc::new(Link {
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            events,
        });
        state.links.retain(|link| link.strong_count() > 0);
        state.links.push(Arc::downgrade(&link));
        Ok(link)
    }
}

/// Opens [`InMemoryClient`]s. The URL is accepted as-is.
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Client = InMemoryClient;

    async fn connect(&self, _url: &str, _timeout: Duration) -> Result<InMemoryClient, BrokerError> {
        let link = self.broker.register()?;
        Ok(InMemoryClient {
            server: Arc::clone(&self.broker.server),
            link,
        })
    }
}

/// Client connection to an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryClient {
    server: Arc<Server>,
    link: Arc<Link>,
}

impl fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("connected", &self.link.connected.load(Ordering::SeqCst))
            .field("closed", &self.link.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl InMemoryClient {
    fn check(&self) -> Result<(), BrokerError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected);
        }
        Ok(())
    }

    /// Run `f` against the server state, failing if this client is not connected.
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut ServerState) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        self.check()?;
        let mut state = self.server.state.lock();
        if !state.running {
            return Err(BrokerError::Disconnected);
        }
        f(&mut state)
    }
}

#[async_trait]
impl BrokerClient for InMemoryClient {
    fn is_connected(&self) -> bool {
        self.check().is_ok()
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.events.subscribe()
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let running = self.server.state.lock().running;
        if !running {
            return Err(BrokerError::ConnectionRefused(
                "broker is not running".to_string(),
            ));
        }
        if !self.link.connected.swap(true, Ordering::SeqCst) {
            self.link.notify(ConnectionEvent::Reconnected);
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.link.closed.swap(true, Ordering::SeqCst) {
            self.link.connected.store(false, Ordering::SeqCst);
            self.link.notify(ConnectionEvent::Closed);
        }
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        self.with_state(|state| {
            state
                .streams
                .get(stream)
                .map(stream_info)
                .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))
        })
    }

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError> {
        validate_name(&config.name)?;
        self.with_state(|state| {
            if let Some(existing) = state.streams.get(&config.name) {
                if existing.config == config {
                    return Ok(stream_info(existing));
                }
                return Err(BrokerError::Rejected(format!(
                    "stream {} already exists with a different configuration",
                    config.name
                )));
            }
            let overlapping = state.streams.values().any(|other| {
                other.config.subjects.iter().any(|theirs| {
                    config
                        .subjects
                        .iter()
                        .any(|ours| subjects_overlap(ours, theirs))
                })
            });
            if overlapping {
                return Err(BrokerError::Rejected(format!(
                    "subjects of stream {} overlap with an existing stream",
                    config.name
                )));
            }
            let data = StreamData {
                config: config.clone(),
                messages: BTreeMap::new(),
                last_sequence: 0,
                consumers: BTreeMap::new(),
            };
            let info = stream_info(&data);
            state.streams.insert(config.name.clone(), data);
            Ok(info)
        })
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError> {
        self.with_state(|state| {
            let stream = state
                .streams
                .get_mut(&config.name)
                .ok_or_else(|| BrokerError::StreamNotFound(config.name.clone()))?;
            if stream.config.storage != config.storage {
                return Err(BrokerError::Rejected(
                    "stream storage type cannot be changed".to_string(),
                ));
            }
            stream.config = config;
            enforce_limits(stream, 0, 0);
            apply_retention(stream);
            Ok(stream_info(stream))
        })
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), BrokerError> {
        self.with_state(|state| {
            state
                .streams
                .remove(stream)
                .map(|_| ())
                .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))
        })
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<ConsumerInfo, BrokerError> {
        self.with_state(|state| {
            let data = get_stream(state, stream)?;
            let consumer_data = data
                .consumers
                .get(consumer)
                .ok_or_else(|| BrokerError::ConsumerNotFound(consumer.to_string()))?;
            Ok(consumer_info(stream, data, consumer_data))
        })
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<String>, BrokerError> {
        self.with_state(|state| Ok(get_stream(state, stream)?.consumers.keys().cloned().collect()))
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError> {
        validate_name(&config.durable_name)?;
        if config.max_ack_pending == 0 {
            return Err(BrokerError::Rejected(
                "max_ack_pending must be positive".to_string(),
            ));
        }
        if config.filter_subject.is_empty()
            || config.filter_subject.chars().any(char::is_whitespace)
        {
            return Err(BrokerError::InvalidName(config.filter_subject.clone()));
        }
        self.with_state(|state| {
            let data = get_stream_mut(state, stream)?;
            if !data
                .config
                .subjects
                .iter()
                .any(|s| subjects_overlap(s, &config.filter_subject))
            {
                return Err(BrokerError::Rejected(format!(
                    "filter {} is not captured by stream {}",
                    config.filter_subject, stream
                )));
            }
            if let Some(existing) = data.consumers.get(&config.durable_name) {
                if existing.config == config {
                    return Ok(consumer_info(stream, data, existing));
                }
                return Err(BrokerError::ConsumerExists(config.durable_name.clone()));
            }

            let next_sequence = match config.deliver_policy {
                DeliverPolicy::All => data
                    .messages
                    .keys()
                    .next()
                    .copied()
                    .unwrap_or(data.last_sequence + 1),
                DeliverPolicy::New => data.last_sequence + 1,
                DeliverPolicy::Last => data
                    .messages
                    .iter()
                    .rev()
                    .find(|(_, m)| subject_matches(&config.filter_subject, &m.subject))
                    .map(|(seq, _)| *seq)
                    .unwrap_or(data.last_sequence + 1),
            };
            let name = config.durable_name.clone();
            data.consumers.insert(
                name.clone(),
                ConsumerData {
                    config,
                    next_sequence,
                    acked: BTreeSet::new(),
                    delivery_counts: BTreeMap::new(),
                    delivered: 0,
                    pending: BTreeMap::new(),
                },
            );
            let created = &data.consumers[&name];
            Ok(consumer_info(stream, data, created))
        })
    }

    async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError> {
        if config.max_ack_pending == 0 {
            return Err(BrokerError::Rejected(
                "max_ack_pending must be positive".to_string(),
            ));
        }
        self.with_state(|state| {
            let data = get_stream_mut(state, stream)?;
            let name = config.durable_name.clone();
            let consumer = data
                .consumers
                .get_mut(&name)
                .ok_or_else(|| BrokerError::ConsumerNotFound(name.clone()))?;
            if consumer.config.filter_subject != config.filter_subject
                || consumer.config.deliver_policy != config.deliver_policy
                || consumer.config.ack_policy != config.ack_policy
            {
                return Err(BrokerError::Rejected(format!(
                    "only ack_wait and max_ack_pending of consumer {} can be updated",
                    name
                )));
            }
            consumer.config = config;
            let updated = &data.consumers[&name];
            Ok(consumer_info(stream, data, updated))
        })
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), BrokerError> {
        self.with_state(|state| {
            let data = get_stream_mut(state, stream)?;
            data.consumers
                .remove(consumer)
                .ok_or_else(|| BrokerError::ConsumerNotFound(consumer.to_string()))?;
            apply_retention(data);
            Ok(())
        })
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        request: FetchRequest,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + request.wait;
        loop {
            let batch =
                self.with_state(|state| try_fetch(state, stream, consumer, request))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(FETCH_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError> {
        self.with_state(|state| settle(state, stream, consumer, sequence))
    }

    async fn term(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError> {
        self.with_state(|state| settle(state, stream, consumer, sequence))
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
    ) -> Result<u64, BrokerError> {
        self.with_state(|state| {
            let data = state
                .streams
                .values_mut()
                .find(|s| s.config.subjects.iter().any(|p| subject_matches(p, subject)))
                .ok_or_else(|| BrokerError::NoStreamForSubject(subject.to_string()))?;

            let message = StoredMessage {
                subject: subject.to_string(),
                payload,
                headers,
            };

            let interested = data
                .consumers
                .values()
                .any(|c| subject_matches(&c.config.filter_subject, subject));
            if data.config.retention == RetentionPolicy::Interest && !interested {
                // nobody would ever acknowledge it
                data.last_sequence += 1;
                return Ok(data.last_sequence);
            }

            if !has_room(data, 1, message.size()) {
                match data.config.discard {
                    DiscardPolicy::New => {
                        return Err(BrokerError::StreamFull(data.config.name.clone()))
                    }
                    DiscardPolicy::Old => enforce_limits(data, 1, message.size()),
                }
            }

            data.last_sequence += 1;
            let sequence = data.last_sequence;
            data.messages.insert(sequence, message);
            Ok(sequence)
        })
    }
}

fn validate_name(name: &str) -> Result<(), BrokerError> {
    let invalid = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'));
    if invalid {
        return Err(BrokerError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn subjects_overlap(a: &str, b: &str) -> bool {
    subject_matches(a, b) || subject_matches(b, a) || a == b
}

fn get_stream<'a>(state: &'a ServerState, stream: &str) -> Result<&'a StreamData, BrokerError> {
    state
        .streams
        .get(stream)
        .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))
}

fn get_stream_mut<'a>(
    state: &'a mut ServerState,
    stream: &str,
) -> Result<&'a mut StreamData, BrokerError> {
    state
        .streams
        .get_mut(stream)
        .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))
}

fn stream_info(data: &StreamData) -> StreamInfo {
    StreamInfo {
        config: data.config.clone(),
        state: StreamState {
            messages: data.messages.len() as u64,
            bytes: data.messages.values().map(|m| m.size() as u64).sum(),
            first_sequence: data.messages.keys().next().copied().unwrap_or(0),
            last_sequence: data.last_sequence,
            consumer_count: data.consumers.len(),
        },
    }
}

fn consumer_info(stream: &str, data: &StreamData, consumer: &ConsumerData) -> ConsumerInfo {
    let num_pending = data
        .messages
        .range(consumer.next_sequence..)
        .filter(|(_, m)| subject_matches(&consumer.config.filter_subject, &m.subject))
        .count() as u64;
    ConsumerInfo {
        stream: stream.to_string(),
        name: consumer.config.durable_name.clone(),
        config: consumer.config.clone(),
        num_ack_pending: consumer.pending.len(),
        num_pending,
        delivered: consumer.delivered,
    }
}

/// Whether `messages` more messages totalling `bytes` fit into the stream.
fn has_room(data: &StreamData, messages: usize, bytes: usize) -> bool {
    let config = &data.config;
    if config.max_messages >= 0 && (data.messages.len() + messages) as i64 > config.max_messages {
        return false;
    }
    if config.max_bytes >= 0 {
        let stored: usize = data.messages.values().map(StoredMessage::size).sum();
        if (stored + bytes) as i64 > config.max_bytes {
            return false;
        }
    }
    true
}

/// Evict oldest messages until `messages` more messages totalling `bytes` fit.
fn enforce_limits(data: &mut StreamData, messages: usize, bytes: usize) {
    while !data.messages.is_empty() && !has_room(data, messages, bytes) {
        if let Some(oldest) = data.messages.keys().next().copied() {
            data.messages.remove(&oldest);
        }
    }
}

/// Drop messages that retention no longer requires.
fn apply_retention(data: &mut StreamData) {
    let removable: Vec<u64> = data
        .messages
        .iter()
        .filter(|(seq, message)| is_retention_complete(data, **seq, message))
        .map(|(seq, _)| *seq)
        .collect();
    for seq in removable {
        data.messages.remove(&seq);
        for consumer in data.consumers.values_mut() {
            consumer.acked.remove(&seq);
            consumer.delivery_counts.remove(&seq);
            consumer.pending.remove(&seq);
        }
    }
}

fn is_retention_complete(data: &StreamData, sequence: u64, message: &StoredMessage) -> bool {
    let mut interested = data
        .consumers
        .values()
        .filter(|c| subject_matches(&c.config.filter_subject, &message.subject))
        .peekable();
    match data.config.retention {
        RetentionPolicy::Limits => false,
        RetentionPolicy::Interest => interested.all(|c| c.acked.contains(&sequence)),
        RetentionPolicy::WorkQueue => {
            interested.peek().is_some() && interested.any(|c| c.acked.contains(&sequence))
        }
    }
}

fn settle(
    state: &mut ServerState,
    stream: &str,
    consumer: &str,
    sequence: u64,
) -> Result<(), BrokerError> {
    let data = get_stream_mut(state, stream)?;
    let consumer_data = data
        .consumers
        .get_mut(consumer)
        .ok_or_else(|| BrokerError::ConsumerNotFound(consumer.to_string()))?;
    consumer_data.pending.remove(&sequence);
    if data.messages.contains_key(&sequence) {
        consumer_data.acked.insert(sequence);
        apply_retention(data);
    }
    Ok(())
}

fn try_fetch(
    state: &mut ServerState,
    stream: &str,
    consumer: &str,
    request: FetchRequest,
) -> Result<Vec<BrokerMessage>, BrokerError> {
    let data = get_stream_mut(state, stream)?;
    let StreamData {
        messages,
        consumers,
        last_sequence,
        ..
    } = data;
    let consumer_data = consumers
        .get_mut(consumer)
        .ok_or_else(|| BrokerError::ConsumerNotFound(consumer.to_string()))?;

    let now = Instant::now();
    let ack_wait = consumer_data.config.ack_wait;
    let explicit = consumer_data.config.ack_policy == AckPolicy::Explicit;
    let max_messages = request.max_messages.max(1);
    let mut batch = Vec::new();
    let mut bytes = 0usize;

    // unacknowledged deliveries whose ack wait ran out (or that were in
    // flight when the server restarted) go first
    let mut due: Vec<u64> = consumer_data
        .pending
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(seq, _)| *seq)
        .collect();
    due.extend(
        consumer_data
            .delivery_counts
            .keys()
            .copied()
            .filter(|seq| consumer_data.is_unacked_due(*seq)),
    );
    due.sort_unstable();
    due.dedup();

    let take = |seq: u64,
                    message: &StoredMessage,
                    consumer_data: &mut ConsumerData,
                    batch: &mut Vec<BrokerMessage>,
                    bytes: &mut usize|
     -> bool {
        let size = message.size();
        if !batch.is_empty() && *bytes + size > request.max_bytes {
            return false;
        }
        *bytes += size;
        let count = consumer_data.delivery_counts.entry(seq).or_insert(0);
        *count += 1;
        let delivery_count = *count;
        consumer_data.delivered += 1;
        if explicit {
            consumer_data.pending.insert(seq, now + ack_wait);
        } else {
            consumer_data.acked.insert(seq);
        }
        batch.push(BrokerMessage {
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            stream_sequence: seq,
            delivery_count,
        });
        true
    };

    for seq in due {
        if batch.len() >= max_messages {
            break;
        }
        let Some(message) = messages.get(&seq) else {
            consumer_data.pending.remove(&seq);
            consumer_data.delivery_counts.remove(&seq);
            continue;
        };
        if !take(seq, message, consumer_data, &mut batch, &mut bytes) {
            return Ok(batch);
        }
    }

    let max_ack_pending = consumer_data.config.max_ack_pending as usize;
    while batch.len() < max_messages && (!explicit || consumer_data.pending.len() < max_ack_pending)
    {
        let next = messages
            .range(consumer_data.next_sequence..)
            .find(|(seq, m)| {
                subject_matches(&consumer_data.config.filter_subject, &m.subject)
                    && !consumer_data.acked.contains(*seq)
            })
            .map(|(seq, m)| (*seq, m.clone()));
        let Some((seq, message)) = next else {
            consumer_data.next_sequence = *last_sequence + 1;
            break;
        };
        if !take(seq, &message, consumer_data, &mut batch, &mut bytes) {
            break;
        }
        consumer_data.next_sequence = seq + 1;
    }

    Ok(batch)
}
