use super::{EmailContent, EmailProvider, SentEmail};
use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

/// Records emails instead of sending them.
#[derive(Clone, Default)]
pub struct MockEmailProvider {
    sent: Arc<Mutex<Vec<EmailContent>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockEmailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn sent(&self) -> Vec<EmailContent> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl EmailProvider for MockEmailProvider {
    async fn send(&self, email: &EmailContent) -> NotificationResult<SentEmail> {
        if let Some(reason) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(NotificationError::Provider(reason));
        }

        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(email.clone());
        Ok(SentEmail {
            message_id: Some(format!("mock-{}", sent.len())),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
