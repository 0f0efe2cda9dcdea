use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::BrokerClient;
use crate::dispatch::{Delivery, DeliveryStats, PendingLimits, Sink, StatsCounter};
use crate::subject::SubscriptionSubjectIdentifier;

/// Local side of one durable consumer: its delivery loop plus the mutable
/// delivery settings the loop reads.
///
/// Dropping the handle stops the loop. The broker-side consumer is left
/// alone; deleting it is the reconciler's call.
pub(crate) struct ConsumerHandle {
    epoch: u64,
    max_in_flight: u32,
    target: watch::Sender<String>,
    limits: watch::Sender<PendingLimits>,
    stats: Arc<StatsCounter>,
    task: JoinHandle<()>,
}

pub(crate) struct BindOptions {
    pub stream: String,
    pub sink_target: String,
    pub max_in_flight: u32,
    pub limits: PendingLimits,
    pub fetch_wait: std::time::Duration,
}

impl ConsumerHandle {
    /// Start delivering for `id` on `client`, bound to connection `epoch`.
    pub(crate) fn bind<C: BrokerClient>(
        id: &SubscriptionSubjectIdentifier,
        client: C,
        epoch: u64,
        sink: Arc<dyn Sink>,
        options: BindOptions,
    ) -> Self {
        let (target, target_rx) = watch::channel(options.sink_target);
        let (limits, limits_rx) = watch::channel(options.limits);
        let stats = Arc::new(StatsCounter::default());

        let delivery = Delivery {
            client,
            stream: options.stream,
            consumer: id.consumer_name().to_string(),
            subject: id.subject().to_string(),
            target: target_rx,
            limits: limits_rx,
            sink,
            stats: Arc::clone(&stats),
            fetch_wait: options.fetch_wait,
        };
        let task = tokio::spawn(delivery.run());

        Self {
            epoch,
            max_in_flight: options.max_in_flight,
            target,
            limits,
            stats,
            task,
        }
    }

    /// Bound to the current connection and still delivering.
    pub(crate) fn is_live(&self, current_epoch: u64) -> bool {
        self.epoch == current_epoch && !self.task.is_finished()
    }

    pub(crate) fn sink_target(&self) -> String {
        self.target.borrow().clone()
    }

    pub(crate) fn set_sink_target(&self, target: &str) {
        self.target.send_if_modified(|current| {
            if current == target {
                return false;
            }
            *current = target.to_string();
            true
        });
    }

    pub(crate) fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    pub(crate) fn set_max_in_flight(&mut self, max_in_flight: u32) {
        self.max_in_flight = max_in_flight;
    }

    pub(crate) fn pending_limits(&self) -> PendingLimits {
        *self.limits.borrow()
    }

    pub(crate) fn set_pending_limits(&self, limits: PendingLimits) {
        self.limits.send_replace(limits);
    }

    pub(crate) fn stats(&self) -> DeliveryStats {
        self.stats.snapshot()
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
