//! Event and payload field names understood by the relay.

/// Registration: bind `userId` to the sending connection.
pub const REGISTER: &str = "register";
/// Registration synonym.
pub const REGISTER_USER: &str = "register_user";
/// Registration synonym.
pub const USER_ONLINE: &str = "user_online";

/// All registration event names. Each one binds identically.
pub const REGISTRATION_EVENTS: [&str; 3] = [REGISTER, REGISTER_USER, USER_ONLINE];

/// Call invitation, routed by `receiverId`.
pub const VIDEO_CALL_INVITE: &str = "video_call_invite";
/// Call accepted, routed back to `callerId`.
pub const VIDEO_CALL_ACCEPTED: &str = "video_call_accepted";
/// Call rejected, routed back to `callerId`.
pub const VIDEO_CALL_REJECTED: &str = "video_call_rejected";
/// Sent to the caller when the invited user is not reachable.
pub const CALL_FAILED: &str = "call_failed";

/// Chat message, routed by `receiverId`.
pub const SEND_MESSAGE: &str = "send_message";
/// Chat message as delivered to the recipient.
pub const RECEIVE_MESSAGE: &str = "receive_message";
/// Delivery receipt for senders that did not request an ack.
pub const MESSAGE_SENT: &str = "message_sent";

/// Liveness probe.
pub const TEST_EVENT: &str = "test_event";
/// Liveness probe reply for senders that did not request an ack.
pub const TEST_RESPONSE: &str = "test_response";

/// Sent once after the transport handshake.
pub const CONNECTED: &str = "connected";
/// Acknowledgment reply carrying the request's ack id.
pub const ACK: &str = "ack";

/// Payload field names.
pub mod fields {
    pub const USER_ID: &str = "userId";
    pub const RECEIVER_ID: &str = "receiverId";
    pub const CALLER_ID: &str = "callerId";
    pub const SENDER_ID: &str = "senderId";
    pub const ID: &str = "id";
    pub const MESSAGE_ID: &str = "messageId";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SUCCESS: &str = "success";
    pub const REASON: &str = "reason";
    pub const MESSAGE: &str = "message";
    pub const DATA: &str = "data";
    pub const CONNECTION_ID: &str = "connectionId";
    pub const VERSION: &str = "version";
}
