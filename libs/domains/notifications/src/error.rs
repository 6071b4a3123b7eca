//! Error types for the notifications domain.

use amqp_worker::ProcessingError;
use thiserror::Error;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur while turning an event into a notification.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Message body or event data does not have the expected shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Template missing or failed to render.
    #[error("Template rendering error: {0}")]
    Template(String),

    /// Email provider rejected or failed to send the message.
    #[error("Email provider error: {0}")]
    Provider(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<handlebars::RenderError> for NotificationError {
    fn from(err: handlebars::RenderError) -> Self {
        NotificationError::Template(err.to_string())
    }
}

impl From<handlebars::TemplateError> for NotificationError {
    fn from(err: handlebars::TemplateError) -> Self {
        NotificationError::Template(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::InvalidPayload(err.to_string())
    }
}

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::Provider(format!("failed to build message: {err}"))
    }
}

impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::Provider(format!("SMTP: {err}"))
    }
}

/// Every notification failure nacks the delivery; payload problems are
/// reported as malformed so they stand out in logs and metrics.
impl From<NotificationError> for ProcessingError {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::InvalidPayload(reason) => ProcessingError::malformed(reason),
            other => ProcessingError::failed_with_source(other.to_string(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_payload_maps_to_malformed() {
        let err: ProcessingError = NotificationError::InvalidPayload("not json".into()).into();
        assert!(err.is_malformed());
        assert_eq!(err.to_string(), "Malformed message: not json");
    }

    #[test]
    fn test_provider_error_maps_to_failed() {
        let err: ProcessingError = NotificationError::Provider("relay down".into()).into();
        assert!(!err.is_malformed());
        assert!(err.to_string().contains("relay down"));
    }
}
