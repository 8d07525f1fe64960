//! Chat message enrichment.
//!
//! Messages relayed through `send_message` are stamped with a server id and,
//! when the client did not provide one, a server timestamp.

use chrono::{SecondsFormat, Utc};
use parley_protocol::events::fields;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A server-assigned message identifier.
pub type MessageId = String;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg_{:x}_{:x}", timestamp, counter)
}

/// Current time as an RFC 3339 UTC string with millisecond precision.
#[must_use]
pub fn server_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Stamp a message payload with `id` and, if absent, a server timestamp.
///
/// Non-object payloads are left untouched. Returns `true` if the payload was
/// stamped.
pub fn enrich(data: &mut Value, id: &str) -> bool {
    let Some(object) = data.as_object_mut() else {
        return false;
    };

    object.insert(fields::ID.to_string(), Value::String(id.to_string()));

    let has_timestamp = object
        .get(fields::TIMESTAMP)
        .is_some_and(|ts| !ts.is_null());
    if !has_timestamp {
        object.insert(
            fields::TIMESTAMP.to_string(),
            Value::String(server_timestamp()),
        );
    }

    true
}
