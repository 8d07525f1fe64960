//! Sessions and outbound mailboxes.
//!
//! A session is the server-side state of one live connection. Each session
//! has a mailbox: an unbounded channel the router delivers into and the
//! transport task drains onto the socket.

use crate::registry::UserId;
use crate::router::DeliveryError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::Envelope;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::trace;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from a transport-assigned value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a connection ID unique within this process.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}{:04x}", timestamp, counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, no user id bound yet.
    Connected,
    /// Bound to at least one user id. Re-registration stays here.
    Registered,
    /// Torn down. Terminal.
    Closed,
}

/// Server-side state for one live connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    user_id: Option<UserId>,
    state: SessionState,
    created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            user_id: None,
            state: SessionState::Connected,
            created_at: Utc::now(),
        }
    }

    /// The connection this session belongs to.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The most recently registered user id, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the connection was accepted.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub(crate) fn mark_registered(&mut self, user_id: UserId) {
        self.user_id = Some(user_id);
        self.state = SessionState::Registered;
    }

    /// Returns `false` if the session was already closed.
    pub(crate) fn mark_closed(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }
}

/// Receiving half of a session's mailbox.
pub type Mailbox = mpsc::UnboundedReceiver<Envelope>;

/// Outbound mailboxes for every live session.
#[derive(Debug, Default)]
pub struct Mailboxes {
    senders: DashMap<ConnectionId, mpsc::UnboundedSender<Envelope>>,
}

impl Mailboxes {
    /// Create an empty mailbox table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox for a connection, replacing any previous one.
    pub fn open(&self, connection_id: &ConnectionId) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(connection_id.clone(), tx);
        rx
    }

    /// Close a connection's mailbox.
    ///
    /// Returns `true` if a mailbox was open.
    pub fn close(&self, connection_id: &ConnectionId) -> bool {
        self.senders.remove(connection_id).is_some()
    }

    /// Queue an envelope for a connection.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::MailboxClosed`] if the connection has no open
    /// mailbox or its receiver has been dropped.
    pub fn deliver(
        &self,
        connection_id: &ConnectionId,
        envelope: Envelope,
    ) -> Result<(), DeliveryError> {
        let sender = self
            .senders
            .get(connection_id)
            .ok_or_else(|| DeliveryError::MailboxClosed(connection_id.clone()))?;

        sender
            .send(envelope)
            .map_err(|_| DeliveryError::MailboxClosed(connection_id.clone()))?;

        trace!(connection = %connection_id, "Queued envelope");
        Ok(())
    }

    /// Number of open mailboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether no mailbox is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_session_state_transitions() {
        let mut session = Session::new(ConnectionId::new("c1"));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.user_id(), None);

        session.mark_registered("alice".to_string());
        session.mark_registered("bob".to_string());
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.user_id(), Some("bob"));

        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_mailbox_delivery() {
        let mailboxes = Mailboxes::new();
        let id = ConnectionId::new("c1");
        let mut rx = mailboxes.open(&id);

        mailboxes
            .deliver(&id, Envelope::new("ping", json!({})))
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, "ping");
    }

    #[test]
    fn test_deliver_to_closed_mailbox() {
        let mailboxes = Mailboxes::new();
        let id = ConnectionId::new("c1");

        let rx = mailboxes.open(&id);
        drop(rx);
        assert!(matches!(
            mailboxes.deliver(&id, Envelope::new("ping", json!({}))),
            Err(DeliveryError::MailboxClosed(_))
        ));

        assert!(mailboxes.close(&id));
        assert!(!mailboxes.close(&id));
        assert!(matches!(
            mailboxes.deliver(&id, Envelope::new("ping", json!({}))),
            Err(DeliveryError::MailboxClosed(_))
        ));
    }
}
