//! Per-event processors.
//!
//! Each processor owns one event name; the [`EventRouter`](crate::EventRouter)
//! dispatches decoded envelopes to them.

mod password_reset;
mod user_registered;

pub use password_reset::{
    PasswordResetRequestedData, PasswordResetRequestedProcessor, PASSWORD_CHANGE_REQUESTED,
    PASSWORD_RESET_SUBJECT,
};
pub use user_registered::{UserRegisteredData, UserRegisteredProcessor, USER_REGISTERED};

use crate::envelope::Envelope;
use crate::error::NotificationResult;
use async_trait::async_trait;

/// Handles every envelope carrying [`EventProcessor::event_name`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Event name this processor is registered under (e.g. `user.registered`).
    fn event_name(&self) -> &'static str;

    async fn process(&self, envelope: &Envelope) -> NotificationResult<()>;
}
