//! Per-consumer delivery loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use super::envelope::EventEnvelope;
use super::sink::Sink;
use crate::broker::{BrokerClient, BrokerMessage, FetchRequest};
use crate::config::SubscriptionDefaults;
use crate::error::BrokerError;

/// Client-side buffering caps of one consumer: how much a single fetch may pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingLimits {
    pub messages: usize,
    pub bytes: usize,
}

impl PendingLimits {
    pub fn new(messages: usize, bytes: usize) -> Self {
        Self { messages, bytes }
    }
}

impl From<&SubscriptionDefaults> for PendingLimits {
    fn from(defaults: &SubscriptionDefaults) -> Self {
        Self::new(defaults.pending_msgs_limit, defaults.pending_bytes_limit)
    }
}

/// Counters of one delivery loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Accepted by the sink and acknowledged.
    pub delivered: u64,
    /// Sink failures; each leaves the message for redelivery.
    pub failed: u64,
    /// Undecodable messages that were terminated.
    pub terminated: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    delivered: AtomicU64,
    failed: AtomicU64,
    terminated: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
        }
    }
}

/// Everything one delivery loop needs. Consumed by [`Delivery::run`].
pub(crate) struct Delivery<C> {
    pub client: C,
    pub stream: String,
    pub consumer: String,
    pub subject: String,
    /// Current sink URL; updated in place on sink-only changes.
    pub target: watch::Receiver<String>,
    pub limits: watch::Receiver<PendingLimits>,
    pub sink: Arc<dyn Sink>,
    pub stats: Arc<StatsCounter>,
    pub fetch_wait: Duration,
}

impl<C: BrokerClient> Delivery<C> {
    /// Pull and dispatch until the client is closed or the consumer is gone.
    pub(crate) async fn run(self) {
        tracing::debug!(consumer = %self.consumer, subject = %self.subject, "delivery loop started");
        loop {
            if self.client.is_closed() {
                break;
            }
            let limits = *self.limits.borrow();
            let request = FetchRequest {
                max_messages: limits.messages.max(1),
                max_bytes: limits.bytes.max(1),
                wait: self.fetch_wait,
            };

            match self.client.fetch(&self.stream, &self.consumer, request).await {
                Ok(batch) => {
                    for message in batch {
                        self.handle(message).await;
                    }
                }
                Err(BrokerError::Closed) => break,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(
                        consumer = %self.consumer,
                        subject = %self.subject,
                        error = %err,
                        "consumer no longer available, stopping delivery"
                    );
                    break;
                }
                Err(err) => {
                    tracing::debug!(consumer = %self.consumer, error = %err, "fetch failed, backing off");
                    tokio::time::sleep(self.fetch_wait).await;
                }
            }
        }
        tracing::debug!(consumer = %self.consumer, subject = %self.subject, "delivery loop stopped");
    }

    async fn handle(&self, message: BrokerMessage) {
        let sequence = message.stream_sequence;
        let event = match EventEnvelope::decode(&message) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(
                    consumer = %self.consumer,
                    subject = %message.subject,
                    sequence,
                    error = %err,
                    "undecodable event, terminating"
                );
                self.stats.terminated.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.client.term(&self.stream, &self.consumer, sequence).await {
                    tracing::warn!(consumer = %self.consumer, sequence, error = %err, "term failed");
                }
                return;
            }
        };

        let target = self.target.borrow().clone();
        match self.sink.deliver(&target, &event).await {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    consumer = %self.consumer,
                    sink = %target,
                    event_id = %event.id,
                    sequence,
                    delivery = message.delivery_count,
                    "event dispatched"
                );
                if let Err(err) = self.client.ack(&self.stream, &self.consumer, sequence).await {
                    // the broker redelivers; the sink sees a duplicate
                    tracing::warn!(consumer = %self.consumer, sequence, error = %err, "ack failed");
                }
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    consumer = %self.consumer,
                    sink = %target,
                    event_id = %event.id,
                    sequence,
                    delivery = message.delivery_count,
                    error = %err,
                    "dispatch failed, leaving event for redelivery"
                );
            }
        }
    }
}
