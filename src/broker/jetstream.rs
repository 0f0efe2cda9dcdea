//! NATS JetStream adapter.
//!
//! Maps the [`Connector`] / [`BrokerClient`] capabilities onto an
//! `async-nats` client. Durable consumers are pull consumers with explicit
//! acknowledgement; fetched messages stay parked in the client until the
//! delivery loop acks or terminates them by stream sequence.
//!
//! `async-nats` re-dials a dropped server by itself. [`JetStreamClient::reconnect`]
//! therefore waits (bounded by the connect timeout) for that background dial
//! to land instead of opening a second connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use async_nats::jetstream::consumer::{self, pull, PullConsumer};
use async_nats::jetstream::context::GetStreamErrorKind;
use async_nats::jetstream::stream::{self, ConsumerErrorKind};
use async_nats::jetstream::{self, AckKind, ErrorCode};
use async_nats::{ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use super::client::{
    AckPolicy, BrokerClient, BrokerMessage, ConnectionEvent, ConsumerConfig, ConsumerInfo,
    Connector, FetchRequest, StreamConfig, StreamInfo, StreamState,
};
use crate::config::{DeliverPolicy, DiscardPolicy, RetentionPolicy, StorageType};
use crate::error::BrokerError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connects to a NATS server with JetStream enabled.
#[derive(Debug, Clone, Default)]
pub struct JetStreamConnector;

impl JetStreamConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for JetStreamConnector {
    type Client = JetStreamClient;

    async fn connect(&self, url: &str, timeout: Duration) -> Result<JetStreamClient, BrokerError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (online_tx, online) = watch::channel(false);
        let online_tx = Arc::new(online_tx);

        let callback_events = events.clone();
        let options = ConnectOptions::new()
            .connection_timeout(timeout)
            .event_callback(move |event| {
                let events = callback_events.clone();
                let online = online_tx.clone();
                async move {
                    tracing::debug!(%event, "nats connection event");
                    match connection_event(&event) {
                        Some(ConnectionEvent::Reconnected) => {
                            online.send_replace(true);
                            let _ = events.send(ConnectionEvent::Reconnected);
                        }
                        Some(mapped) => {
                            online.send_replace(false);
                            let _ = events.send(mapped);
                        }
                        None => {}
                    }
                }
            });

        let client = tokio::time::timeout(timeout, options.connect(url))
            .await
            .map_err(|_| BrokerError::Timeout)?
            .map_err(|e| BrokerError::ConnectionRefused(format!("{url}: {e}")))?;

        tracing::info!(url, "connected to nats");
        Ok(JetStreamClient {
            inner: Arc::new(Inner {
                context: jetstream::new(client.clone()),
                client,
                events,
                online,
                reconnect_window: timeout,
                closed: AtomicBool::new(false),
                consumers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// A JetStream client. Clones share the connection, the consumer cache and
/// the unacknowledged message table.
#[derive(Clone)]
pub struct JetStreamClient {
    inner: Arc<Inner>,
}

type ConsumerKey = (String, String);

struct Inner {
    client: async_nats::Client,
    context: jetstream::Context,
    events: broadcast::Sender<ConnectionEvent>,
    online: watch::Receiver<bool>,
    reconnect_window: Duration,
    closed: AtomicBool,
    consumers: Mutex<HashMap<ConsumerKey, PullConsumer>>,
    /// Fetched, not yet acked messages keyed by consumer and stream sequence.
    pending: Mutex<HashMap<(ConsumerKey, u64), jetstream::Message>>,
}

impl std::fmt::Debug for JetStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamClient")
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl JetStreamClient {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        Ok(())
    }

    async fn stream(&self, name: &str) -> Result<stream::Stream, BrokerError> {
        self.ensure_open()?;
        self.inner
            .context
            .get_stream(name)
            .await
            .map_err(|err| match err.kind() {
                GetStreamErrorKind::JetStream(js) if js.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                    BrokerError::StreamNotFound(name.to_string())
                }
                _ => self.request_error(err),
            })
    }

    async fn consumer(&self, stream: &str, name: &str) -> Result<PullConsumer, BrokerError> {
        let key = (stream.to_string(), name.to_string());
        if let Some(consumer) = self.inner.consumers.lock().get(&key) {
            return Ok(consumer.clone());
        }
        let consumer = self
            .stream(stream)
            .await?
            .get_consumer::<pull::Config>(name)
            .await
            .map_err(|err| self.consumer_error(name, err))?;
        self.inner.consumers.lock().insert(key, consumer.clone());
        Ok(consumer)
    }

    async fn put_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError> {
        let name = config.durable_name.clone();
        let consumer = self
            .stream(stream)
            .await?
            .create_consumer(pull_config(&config))
            .await
            .map_err(|err| self.consumer_error(&name, err))?;
        let info = consumer_info_from(consumer.cached_info());
        self.inner
            .consumers
            .lock()
            .insert((stream.to_string(), name), consumer);
        Ok(info)
    }

    async fn settle(
        &self,
        stream: &str,
        consumer: &str,
        sequence: u64,
        kind: AckKind,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let key = ((stream.to_string(), consumer.to_string()), sequence);
        let message = self
            .inner
            .pending
            .lock()
            .remove(&key)
            .ok_or_else(|| BrokerError::Rejected(format!("{consumer}: no pending message {sequence}")))?;
        message
            .ack_with(kind)
            .await
            .map_err(|e| self.request_error(e))
    }

    fn consumer_error(&self, name: &str, err: stream::ConsumerError) -> BrokerError {
        match err.kind() {
            ConsumerErrorKind::JetStream(js) if js.error_code() == ErrorCode::CONSUMER_NOT_FOUND => {
                BrokerError::ConsumerNotFound(name.to_string())
            }
            ConsumerErrorKind::JetStream(js) if js.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                BrokerError::StreamNotFound(name.to_string())
            }
            ConsumerErrorKind::TimedOut => BrokerError::Timeout,
            ConsumerErrorKind::InvalidName => BrokerError::InvalidName(name.to_string()),
            _ => self.request_error(err),
        }
    }

    /// Request failures turn into `Disconnected` when the link is down so
    /// callers treat them as transient.
    fn request_error(&self, err: impl std::fmt::Display) -> BrokerError {
        if self.is_closed() {
            BrokerError::Closed
        } else if !self.is_connected() {
            BrokerError::Disconnected
        } else {
            BrokerError::Rejected(err.to_string())
        }
    }
}

#[async_trait]
impl BrokerClient for JetStreamClient {
    fn is_connected(&self) -> bool {
        !self.is_closed() && self.inner.client.connection_state() == State::Connected
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }
        let mut online = self.inner.online.clone();
        let back = tokio::time::timeout(self.inner.reconnect_window, online.wait_for(|up| *up)).await;
        match back {
            Ok(Ok(_)) if self.is_connected() => Ok(()),
            _ => Err(BrokerError::Disconnected),
        }
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.inner.client.flush().await {
            tracing::debug!(error = %err, "flush on close failed");
        }
        self.inner.consumers.lock().clear();
        self.inner.pending.lock().clear();
        let _ = self.inner.events.send(ConnectionEvent::Closed);
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError> {
        let mut stream = self.stream(name).await?;
        let info = stream.info().await.map_err(|e| self.request_error(e))?;
        Ok(stream_info_from(info))
    }

    async fn create_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError> {
        self.ensure_open()?;
        let stream = self
            .inner
            .context
            .create_stream(nats_stream_config(&config))
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(stream_info_from(stream.cached_info()))
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamInfo, BrokerError> {
        self.ensure_open()?;
        let info = self
            .inner
            .context
            .update_stream(nats_stream_config(&config))
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(stream_info_from(&info))
    }

    async fn delete_stream(&self, name: &str) -> Result<(), BrokerError> {
        // surfaces StreamNotFound before the delete request
        self.stream(name).await?;
        self.inner
            .context
            .delete_stream(name)
            .await
            .map_err(|e| self.request_error(e))?;
        self.inner.consumers.lock().retain(|(stream, _), _| stream != name);
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerInfo, BrokerError> {
        let mut consumer = self.consumer(stream, name).await?;
        match consumer.info().await {
            Ok(info) => Ok(consumer_info_from(info)),
            Err(err) => {
                // deleted behind our back: forget the cached handle
                self.inner
                    .consumers
                    .lock()
                    .remove(&(stream.to_string(), name.to_string()));
                let missing = self.consumer(stream, name).await;
                Err(missing.err().unwrap_or_else(|| self.request_error(err)))
            }
        }
    }

    async fn list_consumers(&self, stream: &str) -> Result<Vec<String>, BrokerError> {
        let mut names: Vec<String> = self
            .stream(stream)
            .await?
            .consumer_names()
            .try_collect()
            .await
            .map_err(|e| self.request_error(e))?;
        names.sort();
        Ok(names)
    }

    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError> {
        match self.consumer(stream, &config.durable_name).await {
            Ok(_) => return Err(BrokerError::ConsumerExists(config.durable_name)),
            Err(BrokerError::ConsumerNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.put_consumer(stream, config).await
    }

    async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerInfo, BrokerError> {
        // the server applies mutable settings when a durable is re-declared
        self.consumer_info(stream, &config.durable_name).await?;
        self.put_consumer(stream, config).await
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<(), BrokerError> {
        self.inner
            .consumers
            .lock()
            .remove(&(stream.to_string(), name.to_string()));
        self.inner
            .pending
            .lock()
            .retain(|((s, c), _), _| s != stream || c != name);
        self.stream(stream)
            .await?
            .delete_consumer(name)
            .await
            .map_err(|err| self.consumer_error(name, err))?;
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        name: &str,
        request: FetchRequest,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let consumer = self.consumer(stream, name).await?;
        let mut batch = consumer
            .batch()
            .max_messages(request.max_messages)
            .max_bytes(request.max_bytes)
            .expires(request.wait)
            .messages()
            .await
            .map_err(|e| self.request_error(e))?;

        let mut fetched = Vec::new();
        while let Some(next) = batch.next().await {
            let message = next.map_err(|e| self.request_error(e))?;
            let (stream_sequence, delivery_count) = match message.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u32),
                Err(err) => {
                    tracing::warn!(consumer = name, error = %err, "skipping message without metadata");
                    continue;
                }
            };
            fetched.push(BrokerMessage {
                subject: message.subject.to_string(),
                payload: message.payload.to_vec(),
                headers: headers_from(message.headers.as_ref()),
                stream_sequence,
                delivery_count,
            });
            self.inner.pending.lock().insert(
                ((stream.to_string(), name.to_string()), stream_sequence),
                message,
            );
        }
        Ok(fetched)
    }

    async fn ack(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError> {
        self.settle(stream, consumer, sequence, AckKind::Ack).await
    }

    async fn term(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BrokerError> {
        self.settle(stream, consumer, sequence, AckKind::Term).await
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, String>,
    ) -> Result<u64, BrokerError> {
        self.ensure_open()?;
        let ack = self
            .inner
            .context
            .publish_with_headers(subject.to_string(), nats_headers(&headers), payload.into())
            .await
            .map_err(|e| self.request_error(e))?
            .await
            .map_err(|e| self.request_error(e))?;
        Ok(ack.sequence)
    }
}

fn connection_event(event: &Event) -> Option<ConnectionEvent> {
    match event {
        Event::Connected => Some(ConnectionEvent::Reconnected),
        Event::Disconnected => Some(ConnectionEvent::Disconnected),
        _ => None,
    }
}

fn nats_stream_config(config: &StreamConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            StorageType::Memory => stream::StorageType::Memory,
            StorageType::File => stream::StorageType::File,
        },
        retention: match config.retention {
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        discard: match config.discard {
            DiscardPolicy::New => stream::DiscardPolicy::New,
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
        },
        max_messages: config.max_messages,
        max_bytes: config.max_bytes,
        ..Default::default()
    }
}

fn stream_config_from(config: &stream::Config) -> StreamConfig {
    StreamConfig {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        storage: match config.storage {
            stream::StorageType::Memory => StorageType::Memory,
            stream::StorageType::File => StorageType::File,
        },
        retention: match config.retention {
            stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
            stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
            stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
        },
        discard: match config.discard {
            stream::DiscardPolicy::New => DiscardPolicy::New,
            stream::DiscardPolicy::Old => DiscardPolicy::Old,
        },
        max_messages: config.max_messages,
        max_bytes: config.max_bytes,
    }
}

fn stream_info_from(info: &stream::Info) -> StreamInfo {
    StreamInfo {
        config: stream_config_from(&info.config),
        state: StreamState {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        },
    }
}

fn pull_config(config: &ConsumerConfig) -> pull::Config {
    pull::Config {
        durable_name: Some(config.durable_name.clone()),
        filter_subject: config.filter_subject.clone(),
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => consumer::AckPolicy::Explicit,
            AckPolicy::None => consumer::AckPolicy::None,
        },
        ack_wait: config.ack_wait,
        max_ack_pending: i64::from(config.max_ack_pending),
        deliver_policy: match config.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
            DeliverPolicy::Last => consumer::DeliverPolicy::Last,
        },
        ..Default::default()
    }
}

fn consumer_config_from(config: &consumer::Config) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: config
            .durable_name
            .clone()
            .or_else(|| config.name.clone())
            .unwrap_or_default(),
        filter_subject: config.filter_subject.clone(),
        ack_policy: match config.ack_policy {
            consumer::AckPolicy::None => AckPolicy::None,
            _ => AckPolicy::Explicit,
        },
        ack_wait: config.ack_wait,
        max_ack_pending: u32::try_from(config.max_ack_pending).unwrap_or(0),
        deliver_policy: match config.deliver_policy {
            consumer::DeliverPolicy::New => DeliverPolicy::New,
            consumer::DeliverPolicy::Last | consumer::DeliverPolicy::LastPerSubject => {
                DeliverPolicy::Last
            }
            _ => DeliverPolicy::All,
        },
    }
}

fn consumer_info_from(info: &consumer::Info) -> ConsumerInfo {
    ConsumerInfo {
        stream: info.stream_name.clone(),
        name: info.name.clone(),
        config: consumer_config_from(&info.config),
        num_ack_pending: info.num_ack_pending,
        num_pending: info.num_pending,
        delivered: info.delivered.consumer_sequence,
    }
}

fn nats_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

fn headers_from(headers: Option<&HeaderMap>) -> BTreeMap<String, String> {
    let Some(headers) = headers else {
        return BTreeMap::new();
    };
    headers
        .iter()
        .filter_map(|(name, values)| {
            let value = values.first()?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
