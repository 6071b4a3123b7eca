use crate::{env_flag, env_optional, env_or_default, env_parse_or, ConfigError, FromEnv};

/// Transport security negotiated with the relay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte (port 465)
    ImplicitTls,
    /// Plain connection upgraded with STARTTLS
    StartTls,
}

/// SMTP relay settings
#[derive(Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Value of SMTP_SECURE; see [`SmtpConfig::security`]
    pub secure: bool,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

impl SmtpConfig {
    pub const DEFAULT_PORT: u16 = 587;
    pub const DEFAULT_FROM: &'static str = "noreply@example.com";

    /// Well-known ports win over the configured flag
    pub fn security(&self) -> SmtpSecurity {
        match self.port {
            465 => SmtpSecurity::ImplicitTls,
            587 => SmtpSecurity::StartTls,
            _ if self.secure => SmtpSecurity::ImplicitTls,
            _ => SmtpSecurity::StartTls,
        }
    }

    /// Username and password, only when both are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: Self::DEFAULT_PORT,
            secure: false,
            user: None,
            password: None,
            from: Self::DEFAULT_FROM.to_string(),
        }
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("from", &self.from)
            .finish()
    }
}

impl FromEnv for SmtpConfig {
    /// Reads SMTP_HOST, SMTP_PORT, SMTP_SECURE, SMTP_USER, SMTP_PASSWORD, SMTP_FROM
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse_or("SMTP_PORT", Self::DEFAULT_PORT)?,
            secure: env_flag("SMTP_SECURE"),
            user: env_optional("SMTP_USER"),
            password: env_optional("SMTP_PASSWORD"),
            from: env_or_default("SMTP_FROM", Self::DEFAULT_FROM),
        })
    }
}
