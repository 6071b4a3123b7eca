//! Connection loss and recovery against the in-memory broker

mod common;

use amqp_worker::testing::InMemoryBroker;
use amqp_worker::{
    BackoffOverride, ConsumerState, FixedJitter, NoOpCallback, ResilientConsumer,
};
use common::{endpoint, eventually, fast_config, GatedCallback};
use std::time::Duration;
use tokio::time::Instant;

fn within(actual: Duration, expected: Duration) -> bool {
    actual >= expected && actual < expected + Duration::from_millis(10)
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_triggers_single_reconnect() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), NoOpCallback).unwrap();
    consumer.start().await.unwrap();

    // Fires connection and channel observers and ends the delivery stream
    broker.sever_connection("CONNECTION_FORCED - broker restart");

    eventually("reconnect", || broker.connects() == 2 && consumer.is_running()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(broker.connects(), 2);
    assert_eq!(broker.consume_calls(), 2);
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(consumer.consumer_tag().await.as_deref(), Some("amq.ctag-2"));
}

#[tokio::test(start_paused = true)]
async fn test_first_reconnect_waits_initial_delay() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::with_jitter(
        broker.clone(),
        endpoint(),
        fast_config(),
        NoOpCallback,
        FixedJitter(1.0),
    )
    .unwrap();
    consumer.start().await.unwrap();

    let lost_at = Instant::now();
    broker.sever_connection("heartbeat timeout");

    eventually("reconnect", || broker.connects() == 2).await;
    let times = broker.connect_times();
    assert!(within(times[1] - lost_at, Duration::from_millis(100)));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_retries_past_start_limit() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::with_jitter(
        broker.clone(),
        endpoint(),
        fast_config(),
        NoOpCallback,
        FixedJitter(0.0),
    )
    .unwrap();
    consumer.start().await.unwrap();

    broker.fail_next_connects(6);
    let lost_at = Instant::now();
    broker.sever_connection("broker down");

    eventually("reconnect", || consumer.is_running() && broker.connects() == 8).await;

    let times = broker.connect_times();
    let mut previous = lost_at;
    let expected_ms = [100, 100, 200, 400, 800, 1000, 1000];
    for (time, expected) in times[1..].iter().zip(expected_ms) {
        let gap = *time - previous;
        assert!(
            within(gap, Duration::from_millis(expected)),
            "expected ~{expected}ms, got {gap:?}"
        );
        previous = *time;
    }
    assert_eq!(broker.consume_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_reconnect_backoff_is_prompt() {
    let broker = InMemoryBroker::new();
    let config = fast_config().with_backoff(
        BackoffOverride::default()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(30)),
    );
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), config, NoOpCallback).unwrap();
    consumer.start().await.unwrap();

    broker.fail_next_connects(1_000);
    broker.sever_connection("broker down");
    eventually("connecting", || consumer.state() == ConsumerState::Connecting).await;

    tokio::time::timeout(Duration::from_millis(50), consumer.stop())
        .await
        .expect("stop should not wait for the reconnect backoff");
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    let attempts = broker.connects();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(broker.connects(), attempts);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_messages_flow_after_reconnect() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), NoOpCallback).unwrap();
    consumer.start().await.unwrap();

    broker.sever_connection("broker restart");
    eventually("reconnect", || broker.connects() == 2 && consumer.is_running()).await;

    broker.publish_with_id(b"{}".to_vec(), "after-restart");
    eventually("ack", || broker.acked().len() == 1).await;
    assert_eq!(broker.acked()[0].message_id.as_deref(), Some("after-restart"));
}

#[tokio::test(start_paused = true)]
async fn test_message_in_flight_during_loss_is_not_settled() {
    let broker = InMemoryBroker::new();
    let callback = GatedCallback::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), callback.clone()).unwrap();
    consumer.start().await.unwrap();

    broker.publish_with_id(b"{}".to_vec(), "interrupted");
    eventually("in flight", || consumer.in_flight_count() == 1).await;

    broker.sever_connection("broker restart");
    eventually("reconnect", || broker.connects() == 2 && consumer.is_running()).await;

    callback.release(1);
    eventually("handler finished", || consumer.in_flight_count() == 0).await;
    assert!(broker.settled().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_channel_loss_triggers_reconnect() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), NoOpCallback).unwrap();
    consumer.start().await.unwrap();

    broker.sever_channel("PRECONDITION_FAILED - unknown delivery tag");

    eventually("reconnect", || broker.connects() == 2 && consumer.is_running()).await;
    // The old connection was closed during teardown
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_cancel_triggers_reconnect() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), NoOpCallback).unwrap();
    consumer.start().await.unwrap();

    broker.cancel_subscription_remotely();

    eventually("resubscribe", || broker.consume_calls() == 2 && consumer.is_running()).await;
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_loss_during_shutdown_does_not_reconnect() {
    let broker = InMemoryBroker::new();
    let callback = GatedCallback::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), callback.clone()).unwrap();
    consumer.start().await.unwrap();

    broker.publish_with_id(b"{}".to_vec(), "draining");
    eventually("in flight", || consumer.in_flight_count() == 1).await;

    let stopping = consumer.clone();
    let stop = tokio::spawn(async move { stopping.stop().await });
    eventually("shutting down", || consumer.state() == ConsumerState::ShuttingDown).await;

    broker.sever_connection("broker down");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.connects(), 1);

    callback.release(1);
    stop.await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(broker.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_start_after_loss() {
    let broker = InMemoryBroker::new();
    let consumer = ResilientConsumer::new(broker.clone(), endpoint(), fast_config(), NoOpCallback).unwrap();
    consumer.start().await.unwrap();

    broker.fail_next_connects(1_000);
    broker.sever_connection("broker down");
    eventually("connecting", || consumer.state() == ConsumerState::Connecting).await;
    consumer.stop().await;

    broker.fail_next_connects(0);
    consumer.start().await.unwrap();

    let connects = broker.connects();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(consumer.is_running());
    assert_eq!(broker.connects(), connects);
    assert_eq!(broker.open_connections(), 1);
}
