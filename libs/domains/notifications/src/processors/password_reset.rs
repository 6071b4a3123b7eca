use super::EventProcessor;
use crate::envelope::Envelope;
use crate::error::NotificationResult;
use crate::providers::{EmailContent, EmailProvider};
use crate::templates::{TemplateEngine, PASSWORD_RESET_TEMPLATE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub const PASSWORD_CHANGE_REQUESTED: &str = "user.password-change-requested";
pub const PASSWORD_RESET_SUBJECT: &str = "Password Reset Request";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetRequestedData {
    pub user_id: String,
    pub email: String,
    pub token: String,
    pub expires_at: String,
}

impl PasswordResetRequestedData {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.expires_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Emails a password reset link to the requesting user.
pub struct PasswordResetRequestedProcessor {
    provider: Arc<dyn EmailProvider>,
    templates: Arc<TemplateEngine>,
    reset_base_url: String,
}

impl PasswordResetRequestedProcessor {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        templates: Arc<TemplateEngine>,
        reset_base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            templates,
            reset_base_url: reset_base_url.into(),
        }
    }

    /// `{base}/reset-password?token=<token>`, with the token percent-encoded
    pub fn reset_link(&self, token: &str) -> String {
        format!(
            "{}/reset-password?token={}",
            self.reset_base_url.trim_end_matches('/'),
            urlencoding::encode(token)
        )
    }
}

#[async_trait]
impl EventProcessor for PasswordResetRequestedProcessor {
    fn event_name(&self) -> &'static str {
        PASSWORD_CHANGE_REQUESTED
    }

    async fn process(&self, envelope: &Envelope) -> NotificationResult<()> {
        let data: PasswordResetRequestedData = envelope.data_as()?;

        info!(
            envelope_id = ?envelope.id,
            user_id = %data.user_id,
            email = %data.email,
            expires_at = %data.expires_at,
            "Processing user.password-change-requested event"
        );

        if let Some(expires_at) = data.expires_at() {
            if expires_at <= Utc::now() {
                warn!(
                    user_id = %data.user_id,
                    expires_at = %expires_at,
                    "Reset token already expired; sending anyway"
                );
            }
        }

        let html = self
            .templates
            .render(
                PASSWORD_RESET_TEMPLATE,
                &json!({ "resetLink": self.reset_link(&data.token) }),
            )
            .await?;

        let sent = self
            .provider
            .send(&EmailContent::html(&data.email, PASSWORD_RESET_SUBJECT, html))
            .await?;

        info!(
            user_id = %data.user_id,
            provider = self.provider.name(),
            message_id = ?sent.message_id,
            "Password reset email sent"
        );

        Ok(())
    }
}
