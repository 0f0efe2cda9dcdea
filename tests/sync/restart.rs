//! Broker restarts and connection loss.

use sourced_sync::config::StorageType;
use sourced_sync::{ConnectionState, ErrorKind, SubscriptionSpec};

use crate::support::{eventually, settle, EnvOptions, TestEnv, SOURCE};

fn spec(env: &TestEnv) -> SubscriptionSpec {
    SubscriptionSpec::new("default", "inventory", SOURCE, env.receiver.url())
        .with_type("stock.reserved")
}

async fn restart_and_resync(env: &TestEnv, spec: &SubscriptionSpec) {
    env.broker.restart();
    env.sync_until_ready(spec).await;
}

#[tokio::test]
async fn memory_stream_loses_unacknowledged_messages_on_restart() {
    let env = TestEnv::with(EnvOptions::default().storage(StorageType::Memory)).await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();

    env.receiver.set_available(false);
    env.publish("evt-1", "stock.reserved").await;
    eventually(|| env.receiver.rejected() >= 1).await;
    assert_eq!(env.stream_messages().await, 1);

    restart_and_resync(&env, &spec).await;
    assert_eq!(env.stream_messages().await, 0);

    env.receiver.set_available(true);
    settle().await;
    assert_eq!(env.receiver.count(), 0);
}

#[tokio::test]
async fn file_stream_redelivers_after_broker_and_sink_recover() {
    let env = TestEnv::with(EnvOptions::default().storage(StorageType::File)).await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let consumers = env.broker_consumers().await;

    env.receiver.set_available(false);
    env.publish("evt-1", "stock.reserved").await;
    eventually(|| env.receiver.rejected() >= 1).await;

    restart_and_resync(&env, &spec).await;
    assert_eq!(env.stream_messages().await, 1);
    assert_eq!(env.broker_consumers().await, consumers);

    env.receiver.set_available(true);
    eventually(|| env.receiver.count() == 1).await;
    assert_eq!(env.receiver.received()[0].id, "evt-1");
}

#[tokio::test]
async fn delivery_resumes_after_restart_for_both_storage_types() {
    for storage in [StorageType::Memory, StorageType::File] {
        let env = TestEnv::with(EnvOptions::default().storage(storage)).await;
        let spec = spec(&env);
        env.reconciler.sync_subscription(&spec).await.unwrap();

        env.publish("before", "stock.reserved").await;
        eventually(|| env.receiver.count() == 1).await;

        restart_and_resync(&env, &spec).await;
        let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);
        assert!(env.reconciler.is_live(&id).await, "{storage:?}: handle not live");

        env.publish("after", "stock.reserved").await;
        eventually(|| env.receiver.count() == 2).await;
        assert_eq!(env.receiver.received()[1].id, "after", "{storage:?}");
    }
}

#[tokio::test]
async fn exhausted_reconnects_fail_sync_with_connection_error() {
    let env = TestEnv::with(EnvOptions::default().max_reconnects(0)).await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();

    env.broker.shutdown();
    env.wait_for_state(|s| *s == ConnectionState::Closed).await;

    let err = env.reconciler.sync_subscription(&spec).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn filter_change_while_broker_is_down_applies_after_recovery() {
    let options = EnvOptions::default()
        .storage(StorageType::File)
        .max_reconnects(0);
    let env = TestEnv::with(options).await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let epoch = env.connection.epoch();

    env.broker.shutdown();
    env.wait_for_state(|s| *s == ConnectionState::Closed).await;

    let changed = SubscriptionSpec::new("default", "inventory", SOURCE, env.receiver.url())
        .with_type("stock.released");
    let err = env.reconciler.sync_subscription(&changed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    env.broker.start();
    env.reconciler.sync_subscription(&changed).await.unwrap();
    assert!(env.connection.epoch() > epoch);

    let expected: std::collections::BTreeSet<String> = env
        .reconciler
        .identifiers(&changed)
        .unwrap()
        .iter()
        .map(|id| id.consumer_name().to_string())
        .collect();
    assert_eq!(env.broker_consumers().await, expected);

    env.publish("evt-1", "stock.reserved").await;
    env.publish("evt-2", "stock.released").await;
    eventually(|| env.receiver.count() == 1).await;
    settle().await;
    assert_eq!(env.receiver.received()[0].id, "evt-2");
}

#[tokio::test]
async fn closed_connection_is_reinitialized_by_the_next_sync() {
    let env = TestEnv::with(EnvOptions::default().max_reconnects(0)).await;
    let spec = spec(&env);
    env.reconciler.sync_subscription(&spec).await.unwrap();
    let id = env.reconciler.identifiers_for(&spec.key).await.remove(0);

    env.broker.restart();
    env.wait_for_state(|s| *s == ConnectionState::Closed).await;

    env.reconciler.sync_subscription(&spec).await.unwrap();
    assert!(env.connection.is_connected());
    assert!(env.reconciler.is_live(&id).await);

    env.publish("evt-1", "stock.reserved").await;
    eventually(|| env.receiver.count() == 1).await;
}
