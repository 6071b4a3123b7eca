//! Consumer configuration
//!
//! This module provides `ConsumerConfig` and the `QueueDef` trait that domains
//! use to declare the queues they consume.

use std::time::Duration;

use crate::backoff::{BackoffConfig, BackoffOverride};
use crate::error::ConsumerError;

/// How long `stop()` waits for in-flight handlers by default
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often `stop()` re-checks the in-flight set while draining
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue definition trait.
///
/// Each domain implements this trait for the queues it consumes so that queue
/// names and prefetch limits live next to the domain code.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::QueueDef;
///
/// pub struct UserEventsQueue;
///
/// impl QueueDef for UserEventsQueue {
///     const QUEUE_NAME: &'static str = "notification-service.user-events";
/// }
/// ```
pub trait QueueDef: Send + Sync + 'static {
    /// Durable queue name
    const QUEUE_NAME: &'static str;

    /// Per-consumer prefetch limit (None = broker default)
    const PREFETCH: Option<u16> = None;
}

/// Configuration for a resilient consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Durable queue to consume from
    pub queue_name: String,

    /// Unacknowledged deliveries the broker may push at once
    pub prefetch: Option<u16>,

    /// Connect and reconnect backoff
    pub backoff: BackoffConfig,

    /// Upper bound on the in-flight wait during `stop()`
    pub drain_timeout: Duration,

    /// Poll interval of the in-flight wait
    pub drain_poll_interval: Duration,
}

impl ConsumerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            prefetch: None,
            backoff: BackoffConfig::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
        }
    }

    /// Create a new ConsumerConfig from a QueueDef
    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self {
            prefetch: Q::PREFETCH,
            ..Self::new(Q::QUEUE_NAME)
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Merge a partial backoff override over the current backoff settings
    pub fn with_backoff(mut self, overrides: BackoffOverride) -> Self {
        self.backoff = self.backoff.merge(overrides);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConsumerError::config("queue name must not be empty"));
        }
        if self.prefetch == Some(0) {
            return Err(ConsumerError::config("prefetch must be positive"));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(ConsumerError::config("drain poll interval must be positive"));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AuditQueue;

    impl QueueDef for AuditQueue {
        const QUEUE_NAME: &'static str = "audit.events";
        const PREFETCH: Option<u16> = Some(5);
    }

    #[test]
    fn test_from_queue_def() {
        let config = ConsumerConfig::from_queue_def::<AuditQueue>();
        assert_eq!(config.queue_name, "audit.events");
        assert_eq!(config.prefetch, Some(5));
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = ConsumerConfig::new("orders")
            .with_prefetch(20)
            .with_backoff(BackoffOverride::default().max_retries(2))
            .with_drain_timeout(Duration::from_secs(5))
            .with_drain_poll_interval(Duration::from_millis(10));

        assert_eq!(config.prefetch, Some(20));
        assert_eq!(config.backoff.max_retries, 2);
        assert_eq!(config.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_validate() {
        assert!(ConsumerConfig::new("  ").validate().is_err());
        assert!(ConsumerConfig::new("q").with_prefetch(0).validate().is_err());
        assert!(ConsumerConfig::new("q")
            .with_backoff(BackoffOverride::default().multiplier(0.5))
            .validate()
            .is_err());
    }
}
