//! The event envelope.
//!
//! An envelope is the unit of communication in Parley: an event name plus an
//! opaque payload. The relay only looks inside the payload to find routing
//! fields; everything else passes through untouched.

use crate::events;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum event name length.
pub const MAX_EVENT_NAME_LENGTH: usize = 128;

/// Validate an event name.
///
/// # Errors
///
/// Returns an error message if the event name is invalid.
pub fn validate_event_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Event name cannot be empty");
    }
    if name.len() > MAX_EVENT_NAME_LENGTH {
        return Err("Event name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Event name contains invalid characters");
    }
    Ok(())
}

/// A named event with a structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload. `null` when the sender omitted it.
    #[serde(default)]
    pub data: Value,
    /// Acknowledgment id requested by the sender, echoed back on the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }

    /// Request an acknowledgment for this envelope.
    #[must_use]
    pub fn with_ack(mut self, id: u64) -> Self {
        self.ack = Some(id);
        self
    }

    /// Create an acknowledgment reply for request `id`.
    #[must_use]
    pub fn ack(id: u64, data: Value) -> Self {
        Self {
            event: events::ACK.to_string(),
            data,
            ack: Some(id),
        }
    }

    /// Whether this envelope is an acknowledgment reply.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.event == events::ACK && self.ack.is_some()
    }

    /// Read a user identifier field from the payload.
    ///
    /// Strings and numbers are accepted; numbers are rendered in decimal.
    /// Anything else, including an empty string, counts as absent.
    #[must_use]
    pub fn user_field(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::fields;
    use serde_json::json;

    #[test]
    fn test_event_name_validation() {
        assert!(validate_event_name("video_call_invite").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_EVENT_NAME_LENGTH + 1);
        assert!(validate_event_name(&long_name).is_err());
    }

    #[test]
    fn test_ack_envelope() {
        let reply = Envelope::ack(7, json!({ "success": true }));
        assert!(reply.is_ack());
        assert_eq!(reply.event, events::ACK);

        let plain = Envelope::new(events::ACK, Value::Null);
        assert!(!plain.is_ack());
    }

    #[test]
    fn test_user_field() {
        let env = Envelope::new(
            events::REGISTER,
            json!({ "userId": "alice", "receiverId": 42, "callerId": "", "senderId": null }),
        );

        assert_eq!(env.user_field(fields::USER_ID), Some("alice".to_string()));
        assert_eq!(env.user_field(fields::RECEIVER_ID), Some("42".to_string()));
        assert_eq!(env.user_field(fields::CALLER_ID), None);
        assert_eq!(env.user_field(fields::SENDER_ID), None);
        assert_eq!(env.user_field("missing"), None);
    }

    #[test]
    fn test_user_field_on_non_object_payload() {
        let env = Envelope::new(events::SEND_MESSAGE, json!("just a string"));
        assert_eq!(env.user_field(fields::RECEIVER_ID), None);

        let env = Envelope::new(events::SEND_MESSAGE, Value::Null);
        assert_eq!(env.user_field(fields::RECEIVER_ID), None);
    }
}
