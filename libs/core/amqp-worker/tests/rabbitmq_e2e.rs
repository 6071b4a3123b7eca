//! End-to-end consumption against a real broker

use amqp_worker::{
    ConnectionEndpoint, ConsumerConfig, ConsumerState, FnCallback, LapinConnector,
    ProcessingError, RawMessage, ResilientConsumer,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::{TestDataBuilder, TestRabbitMq};

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_consumes_and_settles_messages() -> eyre::Result<()> {
    let rabbit = TestRabbitMq::new().await;
    let builder = TestDataBuilder::from_test_name("test_consumes_and_settles_messages");
    let queue = builder.queue_name("user-events");

    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let recorded = Arc::clone(&seen);
    let callback = FnCallback::new(move |message: RawMessage| {
        let recorded = Arc::clone(&recorded);
        async move {
            recorded.lock().unwrap().push(message.message_id.clone());
            let body: serde_json::Value = serde_json::from_slice(&message.body)
                .map_err(|e| ProcessingError::malformed(e.to_string()))?;
            if body["fail"] == true {
                return Err(ProcessingError::failed("asked to fail"));
            }
            Ok(())
        }
    });

    let endpoint = ConnectionEndpoint::parse(rabbit.url(), "/")?;
    let config = ConsumerConfig::new(queue.clone()).with_prefetch(5);
    let consumer = ResilientConsumer::new(LapinConnector::new(), endpoint, config, callback)?;

    rabbit.publish(&queue, br#"{"ok":true}"#, Some(&builder.message_id("ok"))).await;
    rabbit.publish(&queue, br#"{"fail":true}"#, None).await;

    consumer.start().await?;
    assert_eq!(consumer.state(), ConsumerState::Running);

    for _ in 0..100 {
        if seen.lock().unwrap().len() == 2 && consumer.in_flight_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    consumer.stop().await;
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&Some(builder.message_id("ok"))));

    // The success was acked and the failure nacked without requeue
    assert_eq!(rabbit.queue_depth(&queue).await, 0);
    Ok(())
}
