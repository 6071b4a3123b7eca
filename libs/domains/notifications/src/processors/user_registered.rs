use super::EventProcessor;
use crate::envelope::Envelope;
use crate::error::NotificationResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const USER_REGISTERED: &str = "user.registered";

/// Publishers differ in which fields they send, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRegisteredData {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<String>,
    pub created_at: Option<String>,
}

/// Records new registrations; no email is sent for this event yet.
#[derive(Debug, Clone, Default)]
pub struct UserRegisteredProcessor;

impl UserRegisteredProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventProcessor for UserRegisteredProcessor {
    fn event_name(&self) -> &'static str {
        USER_REGISTERED
    }

    async fn process(&self, envelope: &Envelope) -> NotificationResult<()> {
        let data: UserRegisteredData = match envelope.data_as() {
            Ok(data) => data,
            Err(e) => {
                warn!(envelope_id = ?envelope.id, error = %e, "Unexpected user.registered data shape");
                UserRegisteredData::default()
            }
        };

        info!(
            envelope_id = ?envelope.id,
            user_id = ?data.user_id,
            email = ?data.email,
            first_name = ?data.first_name,
            last_name = ?data.last_name,
            role = ?data.role,
            created_at = ?data.created_at,
            "Processing user.registered event"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_accepts_registration() {
        let envelope = Envelope::new(
            USER_REGISTERED,
            json!({
                "userId": "u-1",
                "email": "ada@example.com",
                "firstName": "Ada",
                "lastName": "Lovelace",
                "role": "user",
                "createdAt": "2026-10-19T08:00:00.000Z"
            }),
        );

        UserRegisteredProcessor::new().process(&envelope).await.unwrap();
    }

    #[tokio::test]
    async fn test_accepts_partial_data() {
        let envelope = Envelope::new(USER_REGISTERED, json!({ "userId": "u-1" }))
            .with_source("user-service")
            .with_id("abc-1");

        let data: UserRegisteredData = envelope.data_as().unwrap();
        assert_eq!(data.user_id.as_deref(), Some("u-1"));
        assert_eq!(data.email, None);

        UserRegisteredProcessor::new().process(&envelope).await.unwrap();
    }

    #[tokio::test]
    async fn test_accepts_data_of_unexpected_shape() {
        let envelope = Envelope::new(USER_REGISTERED, json!("u-1"));

        assert!(envelope.data_as::<UserRegisteredData>().is_err());
        UserRegisteredProcessor::new().process(&envelope).await.unwrap();
    }
}
