//! Codec for encoding and decoding Parley envelopes.
//!
//! Two wire formats are supported:
//!
//! - JSON, carried in WebSocket text frames (browser clients)
//! - MessagePack with a length prefix, carried in binary frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::{validate_event_name, Envelope};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid envelope data.
    #[error("Invalid envelope: {0}")]
    Invalid(&'static str),
}

/// Wire format of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    MessagePack,
}

/// An encoded envelope, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Binary(Bytes),
}

impl Encoded {
    /// Size of the encoded frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    /// Whether the encoded frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate(envelope: Envelope) -> Result<Envelope, ProtocolError> {
    validate_event_name(&envelope.event).map_err(ProtocolError::Invalid)?;
    Ok(envelope)
}

/// Encode an envelope in the given format.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_as(format: Format, envelope: &Envelope) -> Result<Encoded, ProtocolError> {
    match format {
        Format::Json => encode_json(envelope).map(Encoded::Text),
        Format::MessagePack => encode(envelope).map(Encoded::Binary),
    }
}

/// Encode an envelope as a JSON string.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an envelope from a JSON string.
///
/// # Errors
///
/// Returns an error if the text is too large, not an envelope, or carries an
/// invalid event name.
pub fn decode_json(text: &str) -> Result<Envelope, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    validate(serde_json::from_str(text)?)
}

/// Encode an envelope to length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode an envelope from length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    validate(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode an envelope from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(envelope))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let envelope = validate(rmp_serde::from_slice(&payload)?)?;

    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use serde_json::json;

    #[test]
    fn test_json_wire_shape() {
        let text = r#"{"event":"video_call_invite","data":{"receiverId":"bob","callType":"video"},"ack":3}"#;
        let envelope = decode_json(text).unwrap();

        assert_eq!(envelope.event, events::VIDEO_CALL_INVITE);
        assert_eq!(envelope.data["callType"], "video");
        assert_eq!(envelope.ack, Some(3));
    }

    #[test]
    fn test_json_missing_data_defaults_to_null() {
        let envelope = decode_json(r#"{"event":"test_event"}"#).unwrap();
        assert!(envelope.data.is_null());
        assert!(envelope.ack.is_none());

        let text = encode_json(&envelope).unwrap();
        assert!(!text.contains("\"ack\""));
    }

    #[test]
    fn test_json_rejects_bad_envelopes() {
        assert!(matches!(
            decode_json(r#"{"event":"","data":{}}"#),
            Err(ProtocolError::Invalid(_))
        ));
        assert!(matches!(decode_json("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode_json(r#"{"data":{}}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let envelope = Envelope::new(
            events::SEND_MESSAGE,
            json!({ "senderId": "alice", "receiverId": "bob", "content": "hi" }),
        )
        .with_ack(9);

        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let envelope = Envelope::new(events::REGISTER, json!({ "userId": "alice" }));
        let encoded = encode(&envelope).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let mut data = vec![0u8; LENGTH_PREFIX_SIZE];
        data[..4].copy_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());

        match decode(&data) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = Envelope::new(events::REGISTER, json!({ "userId": "alice" }));
        let second = Envelope::new(events::TEST_EVENT, json!({ "x": 1 }));

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        assert_eq!(decode_from(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_as_picks_frame_kind() {
        let envelope = Envelope::new(events::TEST_RESPONSE, json!({ "x": 1 }));

        assert!(matches!(
            encode_as(Format::Json, &envelope).unwrap(),
            Encoded::Text(_)
        ));
        assert!(matches!(
            encode_as(Format::MessagePack, &envelope).unwrap(),
            Encoded::Binary(_)
        ));
    }
}
