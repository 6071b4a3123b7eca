//! Broker-agnostic view of a delivered message

/// A message as handed to processing callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Opaque body bytes
    pub body: Vec<u8>,
    /// Publisher-assigned id, from the `message_id` property or `x-message-id` header
    pub message_id: Option<String>,
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl RawMessage {
    pub fn new(body: impl Into<Vec<u8>>, delivery_tag: u64) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            delivery_tag,
            redelivered: false,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Identifier used for in-flight tracking and log correlation
    ///
    /// Falls back to `delivery-<tag>` when the publisher set no id.
    pub fn identifier(&self) -> String {
        match self.message_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("delivery-{}", self.delivery_tag),
        }
    }

    pub fn body_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}
