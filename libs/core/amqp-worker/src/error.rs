//! Consumer error types
//!
//! Three layers of failure are kept apart:
//! - **TransportError**: a broker operation failed (connect, channel, topology, ack)
//! - **ConsumerError**: what `start()` and construction report to the caller
//! - **ProcessingError**: what a callback reports for a single message (leads to a nack)

use thiserror::Error;

/// Failure of a single broker operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Channel error: {0}")]
    Channel(String),

    /// Queue declaration or prefetch setup was refused
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Acknowledge error: {0}")]
    Acknowledge(String),

    #[error("Session closed")]
    Closed,
}

/// Errors surfaced by the consumer lifecycle
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Invalid consumer configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Initial connection failed on every allowed attempt
    #[error("Failed to connect consumer after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// `stop()` was called while `start()` was still connecting
    #[error("Consumer start cancelled by shutdown")]
    Cancelled,
}

impl ConsumerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Failure reported by a processing callback
///
/// Either variant causes the message to be nacked without requeue.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Body could not be decoded into anything the callback understands
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Processing failed: {message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProcessingError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn failed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

impl From<std::str::Utf8Error> for ProcessingError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::Malformed(format!("body is not valid UTF-8: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_retries_exhausted_keeps_last_cause() {
        let err = ConsumerError::RetriesExhausted {
            attempts: 3,
            source: TransportError::Connect("connection refused".into()),
        };

        assert_eq!(
            err.to_string(),
            "Failed to connect consumer after 3 attempts: Connection error: connection refused"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transport_error_converts_into_consumer_error() {
        let err: ConsumerError = TransportError::Closed.into();
        assert!(matches!(err, ConsumerError::Transport(TransportError::Closed)));
    }

    #[test]
    fn test_processing_error_constructors() {
        assert!(ProcessingError::malformed("bad json").is_malformed());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "smtp down");
        let err = ProcessingError::failed_with_source("send failed", io);
        assert!(!err.is_malformed());
        assert_eq!(err.to_string(), "Processing failed: send failed");
        assert!(err.source().is_some());
    }
}
