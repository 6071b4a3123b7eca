//! Worker-level settings that are not owned by a shared config section.

use amqp_worker::QueueDef;
use core_config::{env_optional, env_or_default, env_parse_optional, ConfigError, FromEnv};
use domain_notifications::UserEventsQueue;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_RESET_PASSWORD_BASE_URL: &str = "http://localhost:3000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Base of the link in password reset emails
    pub reset_password_base_url: String,
    /// Falls back to the reset base URL. Only logged at startup: no handled
    /// event sends verification emails yet.
    pub email_verification_base_url: String,
    pub queue_name: String,
    /// On-disk templates that take precedence over the built-in ones
    pub templates_dir: Option<PathBuf>,
    /// Serve `/metrics` on this port when set
    pub metrics_port: Option<u16>,
}

impl WorkerSettings {
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            reset_password_base_url: DEFAULT_RESET_PASSWORD_BASE_URL.to_string(),
            email_verification_base_url: DEFAULT_RESET_PASSWORD_BASE_URL.to_string(),
            queue_name: UserEventsQueue::QUEUE_NAME.to_string(),
            templates_dir: None,
            metrics_port: None,
        }
    }
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let reset_password_base_url =
            env_or_default("RESET_PASSWORD_BASE_URL", DEFAULT_RESET_PASSWORD_BASE_URL);
        let email_verification_base_url = env_optional("EMAIL_VERIFICATION_BASE_URL")
            .unwrap_or_else(|| reset_password_base_url.clone());

        Ok(Self {
            reset_password_base_url,
            email_verification_base_url,
            queue_name: env_or_default("NOTIFICATION_QUEUE", UserEventsQueue::QUEUE_NAME),
            templates_dir: env_optional("TEMPLATES_DIR").map(PathBuf::from),
            metrics_port: env_parse_optional("METRICS_PORT")?,
        })
    }
}
