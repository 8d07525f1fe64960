//! # parley-protocol
//!
//! Wire protocol definitions for the Parley signaling relay.
//!
//! Every message exchanged with a client is an [`Envelope`]: a named event,
//! an opaque structured payload and an optional acknowledgment id. Envelopes
//! travel either as JSON text frames or as length-prefixed MessagePack binary
//! frames.
//!
//! ## Events
//!
//! - `register` / `register_user` / `user_online` - Bind a user id to the connection
//! - `video_call_invite` / `video_call_accepted` / `video_call_rejected` - Call setup
//! - `send_message` - Chat delivery with server acknowledgment
//! - `test_event` - Relay liveness echo
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, events, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::new(events::REGISTER, json!({ "userId": "alice" }));
//!
//! let text = codec::encode_json(&envelope).unwrap();
//! let decoded = codec::decode_json(&text).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod events;
pub mod version;

pub use codec::{decode, encode, Encoded, Format, ProtocolError};
pub use envelope::Envelope;
pub use version::{Version, PROTOCOL_VERSION};
