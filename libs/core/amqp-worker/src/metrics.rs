//! Prometheus metrics for AMQP consumers
//!
//! Provides observability into delivery throughput, settle outcomes and
//! connection churn.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// With a listen address the exporter serves `/metrics` itself (requires a
/// running Tokio runtime); without one the recorder is installed and output
/// is available through [`render_metrics`]. Subsequent calls are no-ops.
pub fn init_metrics(listen: Option<SocketAddr>) {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let installed = match listen {
            Some(addr) => builder.with_http_listener(addr).install().map(|()| None),
            None => builder.install_recorder().map(Some),
        };

        match installed {
            Ok(handle) => {
                info!(listen = ?listen, "Prometheus metrics initialized");
                handle
            }
            Err(e) => {
                warn!(error = %e, "Failed to install Prometheus recorder, metrics disabled");
                None
            }
        }
    });
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get().and_then(Option::as_ref)
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Consumer metrics helper
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    /// Queue name for labeling
    queue: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn message_received(&self) {
        counter!(
            "amqp_consumer_messages_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a message processed and acked
    pub fn message_acked(&self, duration: Duration) {
        counter!(
            "amqp_consumer_messages_processed_total",
            "queue" => self.queue.clone(),
            "status" => "acked"
        )
        .increment(1);

        histogram!(
            "amqp_consumer_processing_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message rejected after a processing failure
    pub fn message_nacked(&self) {
        counter!(
            "amqp_consumer_messages_processed_total",
            "queue" => self.queue.clone(),
            "status" => "nacked"
        )
        .increment(1);
    }

    /// Record a delivery dropped because shutdown had begun
    pub fn message_skipped(&self) {
        counter!(
            "amqp_consumer_messages_skipped_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn settle_failed(&self) {
        counter!(
            "amqp_consumer_settle_errors_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    pub fn in_flight(&self, count: usize) {
        gauge!(
            "amqp_consumer_in_flight",
            "queue" => self.queue.clone()
        )
        .set(count as f64);
    }

    pub fn connect_attempt(&self) {
        counter!(
            "amqp_consumer_connect_attempts_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record a detected connection loss
    pub fn connection_lost(&self, source: &'static str) {
        counter!(
            "amqp_consumer_connection_losses_total",
            "queue" => self.queue.clone(),
            "source" => source
        )
        .increment(1);
    }

    pub fn reconnected(&self) {
        counter!(
            "amqp_consumer_reconnects_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ConsumerMetrics::new("notification-service.user-events");
        assert_eq!(metrics.queue, "notification-service.user-events");
    }

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        let metrics = ConsumerMetrics::new("q");
        metrics.message_received();
        metrics.message_acked(Duration::from_millis(3));
        metrics.in_flight(2);
        metrics.connection_lost("channel");
    }
}
