//! Processing callback trait.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::ProcessingError;
use crate::message::RawMessage;

/// Message processing callback.
///
/// The consumer acks the message when `process` returns `Ok(())` and nacks it
/// without requeue when it returns an error. Callbacks for different messages
/// may run concurrently, bounded by the queue prefetch.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{ProcessingCallback, ProcessingError, RawMessage};
/// use async_trait::async_trait;
///
/// struct AuditCallback;
///
/// #[async_trait]
/// impl ProcessingCallback for AuditCallback {
///     async fn process(&self, message: &RawMessage) -> Result<(), ProcessingError> {
///         let body = message.body_str()?;
///         tracing::info!(body, "audit event");
///         Ok(())
///     }
///
///     fn name(&self) -> &'static str {
///         "audit_callback"
///     }
/// }
/// ```
#[async_trait]
pub trait ProcessingCallback: Send + Sync {
    /// Process a single delivery.
    async fn process(&self, message: &RawMessage) -> Result<(), ProcessingError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str {
        "callback"
    }
}

#[async_trait]
impl<T: ProcessingCallback + ?Sized> ProcessingCallback for Arc<T> {
    async fn process(&self, message: &RawMessage) -> Result<(), ProcessingError> {
        (**self).process(message).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Adapts an async closure into a callback
pub struct FnCallback<F> {
    f: F,
    name: &'static str,
}

impl<F, Fut> FnCallback<F>
where
    F: Fn(RawMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            name: "fn_callback",
        }
    }

    pub fn named(name: &'static str, f: F) -> Self {
        Self { f, name }
    }
}

#[async_trait]
impl<F, Fut> ProcessingCallback for FnCallback<F>
where
    F: Fn(RawMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send,
{
    async fn process(&self, message: &RawMessage) -> Result<(), ProcessingError> {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// A no-op callback for testing.
#[derive(Debug, Clone, Default)]
pub struct NoOpCallback;

#[async_trait]
impl ProcessingCallback for NoOpCallback {
    async fn process(&self, _message: &RawMessage) -> Result<(), ProcessingError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop_callback"
    }
}

/// A callback that always fails (for testing).
#[derive(Debug, Clone)]
pub struct FailingCallback {
    error_message: String,
}

impl FailingCallback {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
        }
    }
}

#[async_trait]
impl ProcessingCallback for FailingCallback {
    async fn process(&self, _message: &RawMessage) -> Result<(), ProcessingError> {
        Err(ProcessingError::failed(&self.error_message))
    }

    fn name(&self) -> &'static str {
        "failing_callback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_callback() {
        let callback = NoOpCallback;
        let message = RawMessage::new(b"{}".to_vec(), 1);

        assert!(callback.process(&message).await.is_ok());
        assert_eq!(callback.name(), "noop_callback");
    }

    #[tokio::test]
    async fn test_failing_callback() {
        let callback = FailingCallback::new("boom");
        let err = callback
            .process(&RawMessage::new(Vec::new(), 1))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Processing failed: boom");
    }

    #[tokio::test]
    async fn test_fn_callback_sees_message() {
        let callback = FnCallback::named("length_check", |message: RawMessage| async move {
            if message.body.is_empty() {
                Err(ProcessingError::malformed("empty body"))
            } else {
                Ok(())
            }
        });

        assert_eq!(callback.name(), "length_check");
        assert!(callback.process(&RawMessage::new(b"x".to_vec(), 1)).await.is_ok());
        assert!(callback
            .process(&RawMessage::new(Vec::new(), 2))
            .await
            .unwrap_err()
            .is_malformed());
    }

    #[tokio::test]
    async fn test_arc_callback_delegates() {
        let callback: Arc<dyn ProcessingCallback> = Arc::new(FailingCallback::new("nope"));
        assert_eq!(callback.name(), "failing_callback");
        assert!(callback.process(&RawMessage::new(Vec::new(), 1)).await.is_err());
    }
}
