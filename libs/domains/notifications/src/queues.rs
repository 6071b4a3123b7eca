//! Queue definitions for the notifications domain.

use amqp_worker::QueueDef;

/// User lifecycle events published by the user service.
pub struct UserEventsQueue;

impl QueueDef for UserEventsQueue {
    const QUEUE_NAME: &'static str = "notification-service.user-events";
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqp_worker::ConsumerConfig;

    #[test]
    fn test_user_events_queue_def() {
        let config = ConsumerConfig::from_queue_def::<UserEventsQueue>();
        assert_eq!(config.queue_name, "notification-service.user-events");
        assert_eq!(config.prefetch, None);
    }
}
