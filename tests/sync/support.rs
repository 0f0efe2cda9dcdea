//! Harness for the sync suite: an in-memory broker, a reconciler wired to it
//! through a real HTTP sink, and an axum receiver standing in for the sink.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::json;
use sourced_sync::broker::{BrokerClient, InMemoryClient};
use sourced_sync::config::StorageType;
use sourced_sync::{
    BrokerConfig, ConnectionManager, ConnectionState, EventEnvelope, HttpSink, InMemoryBroker,
    InMemoryConnector, Reconciler, SubjectCleaner, SubscriptionDefaults, SubscriptionSpec,
    TypeMatching,
};

pub const SOURCE: &str = "shop";

/// One request accepted by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub id: String,
    pub event_type: String,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct ReceiverState {
    unavailable: AtomicBool,
    received: Mutex<Vec<Received>>,
    rejected: Mutex<usize>,
}

/// HTTP sink endpoint. Answers 503 while marked unavailable.
pub struct Receiver {
    url: String,
    state: Arc<ReceiverState>,
    task: tokio::task::JoinHandle<()>,
}

impl Receiver {
    pub async fn start() -> Self {
        let state = Arc::new(ReceiverState::default());
        let app = Router::new()
            .route("/", post(receive))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}/"),
            state,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.state.received.lock().len()
    }

    pub fn rejected(&self) -> usize {
        *self.state.rejected.lock()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if state.unavailable.load(Ordering::SeqCst) {
        *state.rejected.lock() += 1;
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    state.received.lock().push(Received {
        id: header("ce-id"),
        event_type: header("ce-type"),
        body: body.to_vec(),
    });
    StatusCode::OK
}

/// Knobs for one test environment.
#[derive(Clone)]
pub struct EnvOptions {
    pub storage: StorageType,
    pub max_reconnects: u32,
    pub ack_wait: Duration,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            storage: StorageType::Memory,
            max_reconnects: 10,
            ack_wait: Duration::from_millis(400),
        }
    }
}

impl EnvOptions {
    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }
}

pub struct TestEnv {
    pub broker: InMemoryBroker,
    pub connection: Arc<ConnectionManager<InMemoryConnector>>,
    pub reconciler: Arc<Reconciler<InMemoryConnector>>,
    pub receiver: Receiver,
}

impl TestEnv {
    pub async fn start() -> Self {
        Self::with(EnvOptions::default()).await
    }

    pub async fn with(options: EnvOptions) -> Self {
        let broker = InMemoryBroker::new();
        let config = BrokerConfig {
            max_reconnects: options.max_reconnects,
            reconnect_wait: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            storage_type: options.storage,
            ack_wait: options.ack_wait,
            ..BrokerConfig::default()
        };
        let defaults = SubscriptionDefaults {
            max_in_flight_messages: 9,
            dispatch_timeout: Duration::from_millis(200),
            fetch_wait: Duration::from_millis(20),
            ..SubscriptionDefaults::default()
        };

        let connection = Arc::new(ConnectionManager::new(broker.connector(), config));
        connection.initialize().await.unwrap();
        let sink = HttpSink::new(defaults.dispatch_timeout).unwrap();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&connection),
            Arc::new(SubjectCleaner::new()),
            Arc::new(sink),
            defaults,
        ));

        Self {
            broker,
            connection,
            reconciler,
            receiver: Receiver::start().await,
        }
    }

    pub fn client(&self) -> InMemoryClient {
        self.connection.client().unwrap().0
    }

    pub fn subject(&self, event_type: &str) -> String {
        self.reconciler
            .get_subject(SOURCE, event_type, TypeMatching::Standard)
            .unwrap()
    }

    /// Publish a binary-mode event on the subject of `event_type`.
    pub async fn publish(&self, id: &str, event_type: &str) {
        let event = EventEnvelope::json(id, SOURCE, event_type, &json!({ "id": id }));
        self.client()
            .publish(&self.subject(event_type), event.data.clone(), event.binary_headers())
            .await
            .unwrap();
    }

    pub async fn stream_messages(&self) -> u64 {
        let stream = &self.connection.stream_config().name;
        self.client().stream_info(stream).await.unwrap().state.messages
    }

    pub async fn broker_consumers(&self) -> BTreeSet<String> {
        let stream = &self.connection.stream_config().name;
        self.client()
            .list_consumers(stream)
            .await
            .unwrap()
            .into_iter()
            .collect()
    }

    /// Sync `spec`, retrying while the broker reports itself unavailable,
    /// the way a controller requeues.
    pub async fn sync_until_ready(&self, spec: &SubscriptionSpec) {
        for _ in 0..100 {
            match self.reconciler.sync_subscription(spec).await {
                Ok(()) => return,
                Err(err) if err.is_retryable() => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => panic!("sync failed: {err}"),
            }
        }
        panic!("broker did not become ready");
    }

    pub async fn wait_for_state(&self, expected: fn(&ConnectionState) -> bool) {
        let mut rx = self.connection.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(expected))
            .await
            .expect("connection state not reached")
            .unwrap();
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

/// Give delivery loops time to do something they should not do.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
