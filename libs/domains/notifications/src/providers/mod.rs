//! Email provider implementations.
//!
//! This module contains the `EmailProvider` trait, the lettre-backed
//! `SmtpProvider` and an in-memory `MockEmailProvider` for tests.

mod mock;
mod smtp;

pub use mock::MockEmailProvider;
pub use smtp::SmtpProvider;

use crate::error::NotificationResult;
use async_trait::async_trait;

/// Provider acknowledgement for a sent email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    /// Provider-specific message ID for tracking.
    pub message_id: Option<String>,
}

/// Email content ready for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    /// Recipient email address.
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

impl EmailContent {
    pub fn html(to: impl Into<String>, subject: impl Into<String>, html_body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html_body: html_body.into(),
        }
    }
}

/// Trait for email sending providers.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Send an email.
    async fn send(&self, email: &EmailContent) -> NotificationResult<SentEmail>;

    /// Get the provider name for logging.
    fn name(&self) -> &'static str;

    /// Check that the provider can be reached.
    async fn health_check(&self) -> NotificationResult<bool> {
        Ok(true)
    }
}
