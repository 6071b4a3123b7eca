//! Notifications Domain
//!
//! Turns user lifecycle events consumed from RabbitMQ into emails.
//!
//! ```text
//! ┌──────────────────┐
//! │ ResilientConsumer│  ← amqp-worker, one queue subscription
//! └────────┬─────────┘
//!          │ RawMessage
//! ┌────────▼─────────┐
//! │   EventRouter    │  ← decodes the envelope, picks a processor
//! └────────┬─────────┘
//!          │ Envelope
//! ┌────────▼─────────┐
//! │  EventProcessor  │  ← user.registered, user.password-change-requested
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │ Templates + SMTP │
//! └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let router = EventRouter::new(UserEventsQueue::QUEUE_NAME)
//!     .register(UserRegisteredProcessor::new())
//!     .register(PasswordResetRequestedProcessor::new(provider, templates, reset_base_url));
//! ```

pub mod envelope;
pub mod error;
pub mod processors;
pub mod providers;
pub mod queues;
pub mod router;
pub mod templates;

pub use envelope::{decode_envelope, Decoded, Envelope};
pub use error::{NotificationError, NotificationResult};
pub use processors::{
    EventProcessor, PasswordResetRequestedData, PasswordResetRequestedProcessor,
    UserRegisteredData, UserRegisteredProcessor,
};
pub use providers::{EmailContent, EmailProvider, MockEmailProvider, SentEmail, SmtpProvider};
pub use queues::UserEventsQueue;
pub use router::{EventRouter, RouteOutcome};
pub use templates::TemplateEngine;
