//! Connection and stream lifecycle.
//!
//! [`ConnectionManager`] owns the broker client, the reconnect policy and the
//! target stream. Connection changes are published as [`ConnectionState`]
//! values on a `watch` channel; nothing else in the crate reacts to client
//! callbacks directly.
//!
//! ```text
//!            initialize()                 Disconnected event
//!   Idle ───────────────────▶ Connected ─────────────────────▶ Reconnecting{n}
//!    ▲                         ▲    ▲                              │    │
//!    │                         │    └──────── reconnect ok ────────┘    │
//!    │        initialize()     │                                        │ attempts
//!    └──────────────────── Closed ◀─────────────────────────────────────┘ exhausted
//! ```
//!
//! The reconnect loop only restores the connection. It never recreates a
//! stream that was lost with a Memory-backed broker; [`ConnectionManager::ensure_ready`]
//! does that on the next sync.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::broker::{BrokerClient, ConnectionEvent, Connector, StreamConfig, StreamInfo};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, SyncError};
use crate::subject::prefix_wildcard;

/// Connection state as seen by the rest of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum ConnectionState {
    /// Never initialized.
    Idle,
    Connected,
    /// Automatic reconnect in progress; `attempt` starts at 1.
    Reconnecting { attempt: u32 },
    /// Reconnects exhausted, connection closed or manager shut down.
    Closed,
}

struct Current<C> {
    client: C,
    epoch: u64,
}

/// Owns the broker connection and the target stream.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct ConnectionManager<K: Connector> {
    connector: K,
    config: BrokerConfig,
    stream: StreamConfig,
    current: RwLock<Option<Current<K::Client>>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Serializes initialize calls.
    init_lock: Mutex<()>,
    state: Arc<watch::Sender<ConnectionState>>,
    epoch: AtomicU64,
    exhausted: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl<K: Connector> ConnectionManager<K> {
    pub fn new(connector: K, config: BrokerConfig) -> Self {
        let stream = StreamConfig::from_broker_config(
            &config,
            vec![prefix_wildcard(&config.subject_prefix)],
        );
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            connector,
            config,
            stream,
            current: RwLock::new(None),
            supervisor: parking_lot::Mutex::new(None),
            init_lock: Mutex::new(()),
            state: Arc::new(state),
            epoch: AtomicU64::new(0),
            exhausted: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The stream definition this manager keeps in place.
    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver of every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self
                .current
                .read()
                .as_ref()
                .map(|c| c.client.is_connected())
                .unwrap_or(false)
    }

    /// Number of successful connection establishments so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The current client, if any, with its epoch.
    pub fn client(&self) -> Option<(K::Client, u64)> {
        self.current
            .read()
            .as_ref()
            .map(|c| (c.client.clone(), c.epoch))
    }

    /// Fails with `Connection` once automatic reconnects are exhausted.
    pub fn check(&self) -> Result<(), SyncError> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(SyncError::Connection(format!(
                "gave up after {} reconnect attempts",
                self.config.max_reconnects
            )));
        }
        Ok(())
    }

    /// Connect and make sure the stream exists.
    ///
    /// A no-op (apart from the stream check) when already connected.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Connection(
                "connection manager was shut down".to_string(),
            ));
        }
        let _guard = self.init_lock.lock().await;

        if self.is_connected() {
            if let Some((client, _)) = self.client() {
                self.ensure_stream(&client)
                    .await
                    .map_err(|e| SyncError::Connection(e.to_string()))?;
                return Ok(());
            }
        }

        let client = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector
                .connect(&self.config.url, self.config.connect_timeout),
        )
        .await
        .map_err(|_| BrokerError::Timeout)
        .and_then(|r| r)
        .map_err(|e| {
            tracing::error!(url = %self.config.url, error = %e, "broker connection failed");
            SyncError::Connection(e.to_string())
        })?;

        self.ensure_stream(&client)
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        if let Some(old) = self.supervisor.lock().take() {
            old.abort();
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.current.write().replace(Current {
            client: client.clone(),
            epoch,
        });
        if let Some(previous) = previous {
            previous.client.close().await;
        }

        let events = client.connection_events();
        let supervisor = tokio::spawn(supervise(
            client,
            events,
            self.config.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.exhausted),
        ));
        *self.supervisor.lock() = Some(supervisor);

        self.exhausted.store(false, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        tracing::info!(
            url = %self.config.url,
            stream = %self.stream.name,
            epoch,
            "connected to broker"
        );
        Ok(())
    }

    /// Precondition of every sync: a connected client and an existing stream.
    ///
    /// Idle and Closed managers get one caller-driven `initialize`; while an
    /// automatic reconnect is running this fails fast. When that `initialize`
    /// fails after automatic reconnects were exhausted, the error is the
    /// permanent `Connection` kind.
    pub async fn ensure_ready(&self) -> Result<(K::Client, u64), SyncError> {
        match self.state() {
            ConnectionState::Reconnecting { attempt } => {
                return Err(SyncError::BackendUnavailable(format!(
                    "reconnecting to broker (attempt {})",
                    attempt
                )));
            }
            ConnectionState::Idle | ConnectionState::Closed => {
                if self.stopped.load(Ordering::SeqCst) {
                    return Err(SyncError::BackendUnavailable(
                        "connection manager was shut down".to_string(),
                    ));
                }
                if let Err(err) = self.initialize().await {
                    // automatic reconnects already gave up and the broker is still gone
                    if self.exhausted.load(Ordering::SeqCst) {
                        return Err(SyncError::Connection(format!(
                            "gave up after {} reconnect attempts: {}",
                            self.config.max_reconnects, err
                        )));
                    }
                    return Err(SyncError::BackendUnavailable(err.to_string()));
                }
            }
            ConnectionState::Connected => {}
        }

        let (client, epoch) = self
            .client()
            .ok_or_else(|| SyncError::BackendUnavailable("no broker client".to_string()))?;
        if !client.is_connected() {
            return Err(SyncError::BackendUnavailable(
                "broker connection is down".to_string(),
            ));
        }
        self.ensure_stream(&client)
            .await
            .map_err(|e| SyncError::BackendUnavailable(e.to_string()))?;
        Ok((client, epoch))
    }

    /// Create the stream when missing; bring its mutable settings in line
    /// when they drifted.
    async fn ensure_stream(&self, client: &K::Client) -> Result<StreamInfo, BrokerError> {
        let timeout = self.config.request_timeout;
        let info = match with_timeout(timeout, client.stream_info(&self.stream.name)).await {
            Ok(info) => info,
            Err(BrokerError::StreamNotFound(_)) => {
                let info = with_timeout(timeout, client.create_stream(self.stream.clone())).await?;
                tracing::info!(
                    stream = %self.stream.name,
                    storage = ?self.stream.storage,
                    retention = ?self.stream.retention,
                    discard = ?self.stream.discard,
                    "stream created"
                );
                return Ok(info);
            }
            Err(err) => return Err(err),
        };

        if info.config == self.stream {
            return Ok(info);
        }
        if info.config.storage != self.stream.storage {
            tracing::warn!(
                stream = %self.stream.name,
                existing = ?info.config.storage,
                configured = ?self.stream.storage,
                "stream storage type differs from configuration and cannot be changed"
            );
            return Ok(info);
        }
        let updated = with_timeout(timeout, client.update_stream(self.stream.clone())).await?;
        tracing::info!(stream = %self.stream.name, "stream configuration updated");
        Ok(updated)
    }

    /// Stop the reconnect loop and close the client.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        let current = self.current.write().take();
        if let Some(current) = current {
            current.client.close().await;
        }
        self.state.send_replace(ConnectionState::Closed);
        tracing::info!("broker connection shut down");
    }
}

impl<K: Connector> Drop for ConnectionManager<K> {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
    }
}

pub(crate) async fn with_timeout<T>(
    timeout: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T, BrokerError>>,
) -> Result<T, BrokerError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(BrokerError::Timeout))
}

/// Reacts to the client's connection events for one epoch.
async fn supervise<C: BrokerClient>(
    client: C,
    mut events: broadcast::Receiver<ConnectionEvent>,
    config: BrokerConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    exhausted: Arc<AtomicBool>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) if client.is_connected() => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => ConnectionEvent::Disconnected,
            Err(broadcast::error::RecvError::Closed) => ConnectionEvent::Closed,
        };

        match event {
            ConnectionEvent::Disconnected => {
                if client.is_connected() {
                    continue;
                }
                tracing::warn!("broker connection lost");
                if !reconnect(&client, &config, &state).await {
                    tracing::error!(
                        max_reconnects = config.max_reconnects,
                        "broker reconnect attempts exhausted"
                    );
                    exhausted.store(true, Ordering::SeqCst);
                    state.send_replace(ConnectionState::Closed);
                    client.close().await;
                    return;
                }
            }
            ConnectionEvent::Reconnected => {
                state.send_replace(ConnectionState::Connected);
            }
            ConnectionEvent::Closed => {
                state.send_replace(ConnectionState::Closed);
                return;
            }
        }
    }
}

async fn reconnect<C: BrokerClient>(
    client: &C,
    config: &BrokerConfig,
    state: &watch::Sender<ConnectionState>,
) -> bool {
    for attempt in 1..=config.max_reconnects {
        state.send_replace(ConnectionState::Reconnecting { attempt });
        tokio::time::sleep(config.reconnect_wait).await;
        match client.reconnect().await {
            Ok(()) => {
                tracing::info!(attempt, "reconnected to broker");
                state.send_replace(ConnectionState::Connected);
                return true;
            }
            Err(BrokerError::Closed) => return false,
            Err(err) => {
                tracing::warn!(attempt, error = %err, "broker reconnect failed");
            }
        }
    }
    false
}
