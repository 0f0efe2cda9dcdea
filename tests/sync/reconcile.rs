//! Consumer-set convergence.

use std::collections::BTreeSet;

use serde_json::json;
use sourced_sync::{BrokerClient, ErrorKind, EventEnvelope, SubscriptionSpec, TypeMatching};

use crate::support::{eventually, settle, Receiver, TestEnv, SOURCE};

fn spec(env: &TestEnv) -> SubscriptionSpec {
    SubscriptionSpec::new("default", "orders", SOURCE, env.receiver.url())
        .with_type("order.created")
        .with_type("order.deleted")
}

async fn consumer_names(env: &TestEnv, spec: &SubscriptionSpec) -> BTreeSet<String> {
    env.reconciler
        .identifiers_for(&spec.key)
        .await
        .iter()
        .map(|id| id.consumer_name().to_string())
        .collect()
}

#[tokio::test]
async fn order_created_reaches_the_receiver_once() {
    let env = TestEnv::start().await;
    let spec = SubscriptionSpec::new("default", "order-created", SOURCE, env.receiver.url())
        .with_type("order.created");

    env.reconciler.sync_subscription(&spec).await.unwrap();
    assert_eq!(env.reconciler.consumer_count().await, 1);

    env.publish("evt-1", "order.created").await;
    eventually(|| env.receiver.count() == 1).await;
    settle().await;

    let received = env.receiver.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, "evt-1");
    assert_eq!(received[0].event_type, "order.created");
    assert_eq!(received[0].body, br#"{"id":"evt-1"}"#);
}

#[tokio::test]
async fn resync_without_changes_is_a_no_op() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let before = env.broker_consumers().await;

    env.publish("evt-1", "order.created").await;
    eventually(|| env.receiver.count() == 1).await;

    env.reconciler.sync_subscription(&spec).await.unwrap();

    assert_eq!(env.broker_consumers().await, before);
    assert_eq!(consumer_names(&env, &spec).await, before);
    // the delivery loop was not replaced: its counters survived
    let id = env
        .reconciler
        .identifiers(&spec)
        .unwrap()
        .into_iter()
        .find(|id| id.subject().ends_with("order.created"))
        .unwrap();
    assert_eq!(env.reconciler.delivery_stats(&id).await.unwrap().delivered, 1);
}

#[tokio::test]
async fn sink_change_keeps_consumers_and_reroutes_deliveries() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let ids = env.reconciler.identifiers_for(&spec.key).await;
    let limits = env.reconciler.pending_limits(&ids[0]).await;

    env.publish("evt-1", "order.created").await;
    eventually(|| env.receiver.count() == 1).await;

    let other = Receiver::start().await;
    let changed = spec.clone().with_sink(other.url());
    env.reconciler.sync_subscription(&changed).await.unwrap();

    assert_eq!(env.reconciler.identifiers_for(&spec.key).await, ids);
    assert_eq!(env.reconciler.pending_limits(&ids[0]).await, limits);
    for id in &ids {
        assert_eq!(env.reconciler.sink_for(id).await.as_deref(), Some(other.url()));
    }

    env.publish("evt-2", "order.created").await;
    eventually(|| other.count() == 1).await;
    settle().await;

    assert_eq!(other.received()[0].id, "evt-2");
    assert_eq!(env.receiver.count(), 1, "acknowledged event was redelivered");
}

#[tokio::test]
async fn removing_a_type_deletes_exactly_its_consumer() {
    let env = TestEnv::start().await;
    let spec = spec(&env).with_type("order.shipped");
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let before = consumer_names(&env, &spec).await;
    assert_eq!(before.len(), 3);

    let mut trimmed = spec.clone();
    trimmed.types.retain(|t| t.event_type != "order.deleted");
    env.reconciler.sync_subscription(&trimmed).await.unwrap();

    let removed: BTreeSet<String> = env
        .reconciler
        .identifiers(&spec)
        .unwrap()
        .into_iter()
        .filter(|id| id.subject().ends_with("order.deleted"))
        .map(|id| id.consumer_name().to_string())
        .collect();
    let after = consumer_names(&env, &spec).await;
    let expected: BTreeSet<String> = before.difference(&removed).cloned().collect();
    assert_eq!(after, expected);
    assert_eq!(env.broker_consumers().await, after);
}

#[tokio::test]
async fn untracked_entry_with_live_consumer_is_missing_subscription() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();

    let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);
    assert!(env.reconciler.untrack(&id).await);

    let err = env.reconciler.sync_subscription(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSubscription);
    // the consumer was neither adopted nor removed
    assert!(env.broker_consumers().await.contains(id.consumer_name()));
    assert!(!env.reconciler.is_live(&id).await);
}

#[tokio::test]
async fn identical_subscriptions_fan_out_and_stop_after_delete() {
    let env = TestEnv::start().await;
    let specs: Vec<SubscriptionSpec> = (0..3)
        .map(|i| {
            SubscriptionSpec::new("default", format!("sub-{i}"), SOURCE, env.receiver.url())
                .with_type("order.created")
        })
        .collect();
    for spec in &specs {
        env.reconciler.sync_subscription(spec).await.unwrap();
    }
    assert_eq!(env.broker_consumers().await.len(), 3);

    env.publish("evt-1", "order.created").await;
    eventually(|| env.receiver.count() == 3).await;

    for spec in &specs {
        env.reconciler.delete_subscription(spec).await.unwrap();
    }
    assert!(env.broker_consumers().await.is_empty());
    assert_eq!(env.reconciler.consumer_count().await, 0);

    env.publish("evt-2", "order.created").await;
    settle().await;
    assert_eq!(env.receiver.count(), 3);
}

#[tokio::test]
async fn uncleanable_type_is_rejected_without_broker_changes() {
    let env = TestEnv::start().await;
    let spec = spec(&env).with_type("* >");

    let err = env.reconciler.sync_subscription(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidEventType);
    assert!(env.broker_consumers().await.is_empty());
    assert_eq!(env.reconciler.consumer_count().await, 0);
}

#[tokio::test]
async fn independent_subscriptions_sync_concurrently() {
    let env = TestEnv::start().await;
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let reconciler = env.reconciler.clone();
            let spec = SubscriptionSpec::new("default", format!("sub-{i}"), SOURCE, env.receiver.url())
                .with_type("order.created")
                .with_type("order.deleted");
            tokio::spawn(async move { reconciler.sync_subscription(&spec).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(env.reconciler.consumer_count().await, 16);
    assert_eq!(env.broker_consumers().await.len(), 16);
}

#[tokio::test]
async fn concurrent_syncs_of_one_subscription_converge() {
    let env = TestEnv::start().await;
    let spec = spec(&env);
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let reconciler = env.reconciler.clone();
            let spec = spec.clone();
            tokio::spawn(async move { reconciler.sync_subscription(&spec).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(env.reconciler.consumer_count_for(&spec.key).await, 2);
    assert_eq!(env.broker_consumers().await.len(), 2);
}

#[tokio::test]
async fn wildcard_source_is_rejected_and_never_sees_other_sources() {
    let env = TestEnv::start().await;
    let spec = SubscriptionSpec::new("default", "greedy", "*", env.receiver.url())
        .with_type("order.created");

    let err = env.reconciler.sync_subscription(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSubscription);
    assert!(env.broker_consumers().await.is_empty());

    let subject = env
        .reconciler
        .get_subject("othersource", "order.created", TypeMatching::Standard)
        .unwrap();
    let event = EventEnvelope::json("evt-1", "othersource", "order.created", &json!({}));
    env.client()
        .publish(&subject, event.data.clone(), event.binary_headers())
        .await
        .unwrap();
    settle().await;

    assert_eq!(env.receiver.count(), 0);
    assert_eq!(env.reconciler.consumer_count_for(&spec.key).await, 0);
}

#[tokio::test]
async fn exact_type_with_wildcard_token_is_rejected() {
    let env = TestEnv::start().await;
    let spec = SubscriptionSpec::new("default", "orders", SOURCE, env.receiver.url())
        .with_exact_type("order.>");

    let err = env.reconciler.sync_subscription(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidEventType);
    assert!(env.broker_consumers().await.is_empty());
}
