//! Routes decoded envelopes to the processor registered for their event.

use crate::envelope::{decode_envelope, Decoded};
use crate::error::NotificationResult;
use crate::processors::EventProcessor;
use amqp_worker::{ProcessingCallback, ProcessingError, RawMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A processor handled the event
    Dispatched { event: String },
    /// No processor is registered for the event
    Unhandled { event: String },
    /// The body was JSON but not a usable envelope
    Dropped { reason: &'static str },
}

/// Event name to processor registry, used as the consumer's processing callback.
///
/// Unknown events and incomplete envelopes are logged and acknowledged;
/// unparseable bodies and processor failures are returned as errors, which
/// nacks the delivery.
#[derive(Clone)]
pub struct EventRouter {
    queue: String,
    processors: HashMap<&'static str, Arc<dyn EventProcessor>>,
}

impl EventRouter {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            processors: HashMap::new(),
        }
    }

    /// Register a processor under its event name, replacing any earlier one
    pub fn register(mut self, processor: impl EventProcessor + 'static) -> Self {
        let event = processor.event_name();
        if self.processors.insert(event, Arc::new(processor)).is_some() {
            warn!(queue = %self.queue, event, "Replaced processor for event");
        }
        self
    }

    pub fn handles(&self, event: &str) -> bool {
        self.processors.contains_key(event)
    }

    pub fn events(&self) -> Vec<&'static str> {
        let mut events: Vec<_> = self.processors.keys().copied().collect();
        events.sort_unstable();
        events
    }

    pub async fn route(&self, body: &[u8]) -> NotificationResult<RouteOutcome> {
        let envelope = match decode_envelope(body) {
            Ok(Decoded::Routable(envelope)) => envelope,
            Ok(Decoded::Dropped { reason, id }) => {
                warn!(queue = %self.queue, envelope_id = ?id, reason, "Invalid envelope structure");
                return Ok(RouteOutcome::Dropped { reason });
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Failed to parse message envelope");
                return Err(e);
            }
        };

        let Some(processor) = self.processors.get(envelope.event.as_str()) else {
            warn!(
                queue = %self.queue,
                event = %envelope.event,
                source = ?envelope.source,
                envelope_id = ?envelope.id,
                "Unknown event type received"
            );
            return Ok(RouteOutcome::Unhandled {
                event: envelope.event,
            });
        };

        debug!(queue = %self.queue, event = %envelope.event, envelope_id = ?envelope.id, "Dispatching event");
        processor.process(&envelope).await?;

        Ok(RouteOutcome::Dispatched {
            event: envelope.event,
        })
    }
}

#[async_trait]
impl ProcessingCallback for EventRouter {
    async fn process(&self, message: &RawMessage) -> Result<(), ProcessingError> {
        self.route(&message.body).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "event_router"
    }
}
