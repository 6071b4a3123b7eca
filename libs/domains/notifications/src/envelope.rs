//! Event envelope published by upstream services.
//!
//! ```json
//! { "event": "user.registered", "source": "user-service", "id": "evt-1", "data": { ... } }
//! ```

use crate::error::{NotificationError, NotificationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            source: None,
            id: None,
            data,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn to_bytes(&self) -> NotificationResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize `data` into the payload type a processor expects
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> NotificationResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            NotificationError::InvalidPayload(format!("{} data: {e}", self.event))
        })
    }
}

/// Result of decoding a message body
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Envelope with an event name and data, ready for dispatch
    Routable(Envelope),
    /// Well-formed JSON that is not a usable envelope; acknowledged without dispatch
    Dropped {
        reason: &'static str,
        id: Option<String>,
    },
}

/// Decode a message body into an envelope.
///
/// Bodies that are not JSON, or are JSON `null`, are errors (the delivery is
/// nacked). Any other JSON value lacking a non-empty `event` or a present
/// `data` is [`Decoded::Dropped`]: `data` counts as absent when it is
/// `null`, `false`, `0` or `""`.
pub fn decode_envelope(body: &[u8]) -> NotificationResult<Decoded> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| NotificationError::InvalidPayload(format!("body is not JSON: {e}")))?;

    let mut object = match value {
        Value::Null => {
            return Err(NotificationError::InvalidPayload(
                "envelope is null".to_string(),
            ))
        }
        Value::Object(object) => object,
        _ => {
            return Ok(Decoded::Dropped {
                reason: "envelope is not an object",
                id: None,
            })
        }
    };

    let id = match object.remove("id") {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    let event = match object.remove("event") {
        Some(Value::String(event)) if !event.is_empty() => event,
        Some(other) if is_present(&other) => {
            return Ok(Decoded::Dropped {
                reason: "event is not a string",
                id,
            })
        }
        _ => {
            return Ok(Decoded::Dropped {
                reason: "missing event",
                id,
            })
        }
    };

    let data = match object.remove("data") {
        Some(data) if is_present(&data) => data,
        _ => {
            return Ok(Decoded::Dropped {
                reason: "missing data",
                id,
            })
        }
    };

    let source = match object.remove("source") {
        Some(Value::String(source)) => Some(source),
        _ => None,
    };

    Ok(Decoded::Routable(Envelope {
        event,
        source,
        id,
        data,
    }))
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> NotificationResult<Decoded> {
        decode_envelope(value.to_string().as_bytes())
    }

    #[test]
    fn test_decode_routable_envelope() {
        let decoded = decode(json!({
            "event": "user.registered",
            "source": "user-service",
            "id": "evt-1",
            "data": { "userId": "u-1" }
        }))
        .unwrap();

        assert_eq!(
            decoded,
            Decoded::Routable(
                Envelope::new("user.registered", json!({ "userId": "u-1" }))
                    .with_source("user-service")
                    .with_id("evt-1")
            )
        );
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let err = decode_envelope(b"{not json").unwrap_err();
        assert!(matches!(err, NotificationError::InvalidPayload(_)));
    }

    #[test]
    fn test_json_null_is_an_error() {
        assert!(decode_envelope(b"null").is_err());
    }

    #[test]
    fn test_non_object_is_dropped() {
        for body in [json!([1, 2]), json!("user.registered"), json!(42), json!(true)] {
            assert!(matches!(
                decode(body).unwrap(),
                Decoded::Dropped {
                    reason: "envelope is not an object",
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_missing_or_empty_event_is_dropped() {
        for body in [
            json!({ "id": "evt-2", "data": {} }),
            json!({ "id": "evt-2", "event": "", "data": {} }),
            json!({ "id": "evt-2", "event": null, "data": {} }),
        ] {
            assert_eq!(
                decode(body).unwrap(),
                Decoded::Dropped {
                    reason: "missing event",
                    id: Some("evt-2".to_string())
                }
            );
        }
    }

    #[test]
    fn test_absent_data_is_dropped() {
        for data in [Value::Null, json!(false), json!(0), json!("")] {
            let decoded = decode(json!({ "event": "user.registered", "data": data })).unwrap();
            assert!(matches!(
                decoded,
                Decoded::Dropped {
                    reason: "missing data",
                    id: None
                }
            ));
        }
        let decoded = decode(json!({ "event": "user.registered" })).unwrap();
        assert!(matches!(decoded, Decoded::Dropped { .. }));
    }

    #[test]
    fn test_empty_object_data_is_routable() {
        let decoded = decode(json!({ "event": "user.registered", "data": {} })).unwrap();
        assert!(matches!(decoded, Decoded::Routable(_)));
    }

    #[test]
    fn test_data_as_reports_event_name() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Payload {
            email: String,
        }

        let envelope = Envelope::new("user.registered", json!({ "name": "x" }));
        let err = envelope.data_as::<Payload>().unwrap_err();
        assert!(err.to_string().contains("user.registered data"));
    }
}
