//! Dispatch through the HTTP sink.

use sourced_sync::broker::BrokerClient;
use sourced_sync::{EventEnvelope, PendingLimits, SubscriptionSpec};

use crate::support::{eventually, settle, TestEnv, SOURCE};

fn spec(env: &TestEnv) -> SubscriptionSpec {
    SubscriptionSpec::new("default", "payments", SOURCE, env.receiver.url())
        .with_type("payment.captured")
}

#[tokio::test]
async fn failed_dispatch_is_redelivered_once_the_sink_recovers() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);

    env.receiver.set_available(false);
    env.publish("evt-1", "payment.captured").await;
    eventually(|| env.receiver.rejected() >= 1).await;
    assert_eq!(env.stream_messages().await, 1, "message was acknowledged on failure");

    env.receiver.set_available(true);
    eventually(|| env.receiver.count() == 1).await;
    assert_eq!(env.receiver.received()[0].id, "evt-1");

    let stats = env.reconciler.delivery_stats(&id).await.unwrap();
    assert_eq!(stats.delivered, 1);
    assert!(stats.failed >= 1);

    // interest retention drops it once acknowledged
    for _ in 0..50 {
        if env.stream_messages().await == 0 {
            break;
        }
        settle().await;
    }
    assert_eq!(env.stream_messages().await, 0);
}

#[tokio::test]
async fn structured_events_are_delivered_in_binary_mode() {
    let env = TestEnv::start().await;
    env.reconciler.sync_subscription(&spec(&env)).await.unwrap();

    let event = EventEnvelope::new("evt-s", SOURCE, "payment.captured", b"raw bytes".to_vec());
    env.client()
        .publish(
            &env.subject("payment.captured"),
            event.to_structured(),
            Default::default(),
        )
        .await
        .unwrap();

    eventually(|| env.receiver.count() == 1).await;
    let received = &env.receiver.received()[0];
    assert_eq!(received.id, "evt-s");
    assert_eq!(received.event_type, "payment.captured");
    assert_eq!(received.body, b"raw bytes");
}

#[tokio::test]
async fn events_of_other_types_are_not_delivered() {
    let env = TestEnv::start().await;
    env.reconciler.sync_subscription(&spec(&env)).await.unwrap();

    env.publish("evt-1", "payment.refunded").await;
    env.publish("evt-2", "payment.captured").await;

    eventually(|| env.receiver.count() == 1).await;
    settle().await;
    assert_eq!(env.receiver.received()[0].id, "evt-2");
}

#[tokio::test]
async fn max_in_flight_change_is_applied_to_the_broker_consumer() {
    let env = TestEnv::start().await;
    let spec = spec(&env).with_max_in_flight(3);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);
    let stream = env.connection.stream_config().name.clone();

    let info = env.client().consumer_info(&stream, id.consumer_name()).await.unwrap();
    assert_eq!(info.config.max_ack_pending, 3);

    let spec = spec.with_max_in_flight(12);
    env.reconciler.sync_subscription(&spec).await.unwrap();

    let info = env.client().consumer_info(&stream, id.consumer_name()).await.unwrap();
    assert_eq!(info.config.max_ack_pending, 12);
    assert!(env.reconciler.is_live(&id).await);
}

#[tokio::test]
async fn default_in_flight_bound_applies_when_unset() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);

    let info = env
        .client()
        .consumer_info(&env.connection.stream_config().name, id.consumer_name())
        .await
        .unwrap();
    assert_eq!(info.config.max_ack_pending, 9);
}

#[tokio::test]
async fn pending_limits_bound_each_fetch() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);

    assert!(
        env.reconciler
            .set_pending_limits(&id, PendingLimits::new(1, 1024))
            .await
    );
    for i in 0..5 {
        env.publish(&format!("evt-{i}"), "payment.captured").await;
    }

    eventually(|| env.receiver.count() == 5).await;
    let ids: Vec<String> = env.receiver.received().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["evt-0", "evt-1", "evt-2", "evt-3", "evt-4"]);
}
