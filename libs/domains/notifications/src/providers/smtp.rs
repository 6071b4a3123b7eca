//! SMTP email provider implementation using lettre.

use super::{EmailContent, EmailProvider, SentEmail};
use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use core_config::smtp::{SmtpConfig, SmtpSecurity};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, error, info};

/// SMTP relay provider.
///
/// Port 465 uses implicit TLS; every other port upgrades with STARTTLS when
/// the server offers it, so local relays such as Mailpit keep working.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
    port: u16,
}

impl SmtpProvider {
    /// Create a new SMTP provider.
    pub fn new(config: &SmtpConfig) -> NotificationResult<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| NotificationError::Config(format!("Invalid SMTP_FROM address: {e}")))?;

        Ok(Self {
            transport: Self::build_transport(config)?,
            from,
            host: config.host.clone(),
            port: config.port,
        })
    }

    fn build_transport(config: &SmtpConfig) -> NotificationResult<AsyncSmtpTransport<Tokio1Executor>> {
        let parameters = TlsParameters::new(config.host.clone())
            .map_err(|e| NotificationError::Config(format!("Invalid SMTP TLS parameters: {e}")))?;
        let tls = match config.security() {
            SmtpSecurity::ImplicitTls => Tls::Wrapper(parameters),
            SmtpSecurity::StartTls => Tls::Opportunistic(parameters),
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .tls(tls);

        if let Some((user, password)) = config.credentials() {
            builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
        }

        Ok(builder.build())
    }

    fn build_message(&self, email: &EmailContent) -> NotificationResult<Message> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| NotificationError::Provider(format!("Invalid recipient '{}': {e}", email.to)))?;

        Ok(Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject)
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())?)
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, email: &EmailContent) -> NotificationResult<SentEmail> {
        debug!(
            to = %email.to,
            subject = %email.subject,
            host = %self.host,
            port = self.port,
            "Sending email via SMTP"
        );

        let message = self.build_message(email)?;

        let response = self.transport.send(message).await.map_err(|e| {
            error!(to = %email.to, subject = %email.subject, error = %e, "Failed to send email");
            NotificationError::from(e)
        })?;

        let message_id = response.message().next().map(|s| s.to_string());

        info!(
            to = %email.to,
            subject = %email.subject,
            message_id = ?message_id,
            "Email sent successfully"
        );

        Ok(SentEmail { message_id })
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        Ok(self.transport.test_connection().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "mail.example.com".to_string(),
            from: "Notifications <noreply@example.com>".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_invalid_from() {
        let config = SmtpConfig {
            from: "not an address".to_string(),
            ..config()
        };
        assert!(matches!(SmtpProvider::new(&config), Err(NotificationError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_html_message() {
        let provider = SmtpProvider::new(&config()).unwrap();
        let email = EmailContent::html("user@example.com", "Password Reset Request", "<p>hi</p>");

        let message = provider.build_message(&email).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("To: user@example.com"));
        assert!(raw.contains("Subject: Password Reset Request"));
        assert!(raw.contains("Content-Type: text/html"));
        assert_eq!(provider.name(), "smtp");
    }

    #[tokio::test]
    async fn test_rejects_invalid_recipient() {
        let provider = SmtpProvider::new(&config()).unwrap();
        let email = EmailContent::html("nobody", "subject", "body");
        assert!(matches!(
            provider.build_message(&email),
            Err(NotificationError::Provider(_))
        ));
    }
}
