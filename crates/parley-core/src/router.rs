//! Directed event router for Parley.
//!
//! The router resolves the destination user named in an event's payload and
//! forwards the event to that user's connection. What happens when the user
//! cannot be reached depends on the event's [`Route`].

use crate::message::{enrich, generate_message_id};
use crate::registry::{Registry, UserId};
use crate::session::{ConnectionId, Mailboxes};
use parley_protocol::events::{self, fields};
use parley_protocol::Envelope;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Reasons a directed event could not be handed to its destination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The payload does not name a recipient.
    #[error("Missing recipient field: {0}")]
    MissingRecipient(&'static str),

    /// The recipient is not registered.
    #[error("User is not connected: {0}")]
    Unreachable(UserId),

    /// The recipient's connection is tearing down.
    #[error("Connection closed: {0}")]
    MailboxClosed(ConnectionId),
}

/// How an inbound event is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to `recipient`; tell the sender with `miss_event` if that fails.
    NotifyOnMiss {
        recipient: &'static str,
        forward_as: &'static str,
        miss_event: &'static str,
    },
    /// Forward to `recipient`; drop silently if that fails.
    DropOnMiss {
        recipient: &'static str,
        forward_as: &'static str,
    },
    /// Stamp, forward to `recipient`, and always acknowledge the sender.
    Deliver {
        recipient: &'static str,
        forward_as: &'static str,
        receipt_event: &'static str,
    },
    /// Reply to the sender only.
    Echo { reply_event: &'static str },
}

impl Route {
    /// Short policy name for logs and metrics.
    #[must_use]
    pub fn policy(&self) -> &'static str {
        match self {
            Route::NotifyOnMiss { .. } => "notify_on_miss",
            Route::DropOnMiss { .. } => "drop_on_miss",
            Route::Deliver { .. } => "deliver",
            Route::Echo { .. } => "echo",
        }
    }
}

/// The routes the relay serves, keyed by inbound event name.
pub const DEFAULT_ROUTES: [(&str, Route); 5] = [
    (
        events::VIDEO_CALL_INVITE,
        Route::NotifyOnMiss {
            recipient: fields::RECEIVER_ID,
            forward_as: events::VIDEO_CALL_INVITE,
            miss_event: events::CALL_FAILED,
        },
    ),
    (
        events::VIDEO_CALL_REJECTED,
        Route::DropOnMiss {
            recipient: fields::CALLER_ID,
            forward_as: events::VIDEO_CALL_REJECTED,
        },
    ),
    (
        events::VIDEO_CALL_ACCEPTED,
        Route::DropOnMiss {
            recipient: fields::CALLER_ID,
            forward_as: events::VIDEO_CALL_ACCEPTED,
        },
    ),
    (
        events::SEND_MESSAGE,
        Route::Deliver {
            recipient: fields::RECEIVER_ID,
            forward_as: events::RECEIVE_MESSAGE,
            receipt_event: events::MESSAGE_SENT,
        },
    ),
    (
        events::TEST_EVENT,
        Route::Echo {
            reply_event: events::TEST_RESPONSE,
        },
    ),
];

/// What happened to a routed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the destination connection's mailbox.
    Forwarded(ConnectionId),
    /// The destination could not be reached.
    Missed(DeliveryError),
    /// Answered to the sender only.
    Echoed,
}

impl RouteOutcome {
    /// Short outcome name for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Forwarded(_) => "forwarded",
            RouteOutcome::Missed(_) => "missed",
            RouteOutcome::Echoed => "echoed",
        }
    }
}

/// A reply owed to the sender of a routed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A plain event.
    Event(Envelope),
    /// An acknowledgment. Sent as an `ack` frame when the sender asked for
    /// one, otherwise as `fallback_event`.
    Ack {
        fallback_event: &'static str,
        data: Value,
    },
}

impl Reply {
    /// Turn the reply into the envelope sent back to the sender.
    #[must_use]
    pub fn into_envelope(self, ack: Option<u64>) -> Envelope {
        match (self, ack) {
            (Reply::Event(envelope), _) => envelope,
            (Reply::Ack { data, .. }, Some(id)) => Envelope::ack(id, data),
            (Reply::Ack { fallback_event, data }, None) => Envelope::new(fallback_event, data),
        }
    }
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    /// What happened to the event.
    pub outcome: RouteOutcome,
    /// Reply owed to the sender, if any.
    pub reply: Option<Reply>,
}

/// The directed event router.
///
/// Shares the registry and mailbox table with the lifecycle manager; it
/// never blocks and never retries.
pub struct Router {
    registry: Arc<Registry>,
    mailboxes: Arc<Mailboxes>,
}

impl Router {
    /// Create a router over a registry and mailbox table.
    #[must_use]
    pub fn new(registry: Arc<Registry>, mailboxes: Arc<Mailboxes>) -> Self {
        Self {
            registry,
            mailboxes,
        }
    }

    /// Route `envelope`, received from `sender`, according to `route`.
    pub fn route(&self, sender: &ConnectionId, route: Route, envelope: Envelope) -> Routed {
        trace!(connection = %sender, event = %envelope.event, policy = route.policy(), "Routing");

        match route {
            Route::NotifyOnMiss {
                recipient,
                forward_as,
                miss_event,
            } => {
                let target = envelope.user_field(recipient);
                match self.forward(target.as_deref(), recipient, forward_as, envelope.data) {
                    Ok(connection) => Routed {
                        outcome: RouteOutcome::Forwarded(connection),
                        reply: None,
                    },
                    Err(e) => {
                        debug!(connection = %sender, error = %e, "Notifying sender of miss");
                        let failure = Envelope::new(
                            miss_event,
                            json!({
                                recipient: target,
                                (fields::REASON): e.to_string(),
                            }),
                        );
                        Routed {
                            outcome: RouteOutcome::Missed(e),
                            reply: Some(Reply::Event(failure)),
                        }
                    }
                }
            }

            Route::DropOnMiss {
                recipient,
                forward_as,
            } => {
                let target = envelope.user_field(recipient);
                let outcome =
                    match self.forward(target.as_deref(), recipient, forward_as, envelope.data) {
                        Ok(connection) => RouteOutcome::Forwarded(connection),
                        Err(e) => {
                            debug!(connection = %sender, error = %e, "Dropping event");
                            RouteOutcome::Missed(e)
                        }
                    };
                Routed {
                    outcome,
                    reply: None,
                }
            }

            Route::Deliver {
                recipient,
                forward_as,
                receipt_event,
            } => {
                let target = envelope.user_field(recipient);
                let message_id = generate_message_id();
                let mut data = envelope.data;
                enrich(&mut data, &message_id);

                let outcome = match self.forward(target.as_deref(), recipient, forward_as, data) {
                    Ok(connection) => RouteOutcome::Forwarded(connection),
                    Err(e) => {
                        debug!(connection = %sender, error = %e, message = %message_id, "Message not delivered");
                        RouteOutcome::Missed(e)
                    }
                };

                // The receipt confirms the relay accepted the message, not
                // that the recipient got it.
                Routed {
                    outcome,
                    reply: Some(Reply::Ack {
                        fallback_event: receipt_event,
                        data: json!({
                            (fields::SUCCESS): true,
                            (fields::MESSAGE_ID): message_id,
                        }),
                    }),
                }
            }

            Route::Echo { reply_event } => Routed {
                outcome: RouteOutcome::Echoed,
                reply: Some(Reply::Ack {
                    fallback_event: reply_event,
                    data: json!({
                        (fields::MESSAGE): "Server received your test event",
                        (fields::DATA): envelope.data,
                    }),
                }),
            },
        }
    }

    fn forward(
        &self,
        target: Option<&str>,
        recipient: &'static str,
        forward_as: &'static str,
        data: Value,
    ) -> Result<ConnectionId, DeliveryError> {
        let user_id = target.ok_or(DeliveryError::MissingRecipient(recipient))?;
        let connection = self
            .registry
            .resolve(user_id)
            .ok_or_else(|| DeliveryError::Unreachable(user_id.to_string()))?;

        self.mailboxes
            .deliver(&connection, Envelope::new(forward_as, data))?;

        debug!(user = %user_id, connection = %connection, event = %forward_as, "Forwarded");
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Mailbox;

    fn route_for(event: &str) -> Route {
        DEFAULT_ROUTES
            .iter()
            .find(|(name, _)| *name == event)
            .map(|(_, route)| *route)
            .unwrap()
    }

    struct Fixture {
        registry: Arc<Registry>,
        mailboxes: Arc<Mailboxes>,
        router: Router,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let mailboxes = Arc::new(Mailboxes::new());
            let router = Router::new(Arc::clone(&registry), Arc::clone(&mailboxes));
            Self {
                registry,
                mailboxes,
                router,
            }
        }

        fn connect(&self, id: &str, user: &str) -> (ConnectionId, Mailbox) {
            let conn = ConnectionId::new(id);
            let rx = self.mailboxes.open(&conn);
            self.registry.bind(user, &conn);
            (conn, rx)
        }

        fn route(&self, sender: &ConnectionId, envelope: Envelope) -> Routed {
            let route = route_for(&envelope.event);
            self.router.route(sender, route, envelope)
        }
    }

    #[test]
    fn test_invite_forwarded_verbatim() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.connect("c-alice", "alice");
        let (bob, mut bob_rx) = fx.connect("c-bob", "bob");

        let payload = json!({ "receiverId": "bob", "callerId": "alice", "offer": { "sdp": "v=0" } });
        let routed = fx.route(&alice, Envelope::new(events::VIDEO_CALL_INVITE, payload.clone()));

        assert_eq!(routed.outcome, RouteOutcome::Forwarded(bob));
        assert!(routed.reply.is_none());

        let delivered = bob_rx.try_recv().unwrap();
        assert_eq!(delivered.event, events::VIDEO_CALL_INVITE);
        assert_eq!(delivered.data, payload);
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_invite_miss_notifies_sender() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.connect("c-alice", "alice");
        let (_bob, mut bob_rx) = fx.connect("c-bob", "bob");

        let routed = fx.route(
            &alice,
            Envelope::new(events::VIDEO_CALL_INVITE, json!({ "receiverId": "carol" })),
        );

        assert_eq!(
            routed.outcome,
            RouteOutcome::Missed(DeliveryError::Unreachable("carol".to_string()))
        );
        match routed.reply {
            Some(Reply::Event(envelope)) => {
                assert_eq!(envelope.event, events::CALL_FAILED);
                assert_eq!(envelope.data["receiverId"], "carol");
            }
            other => panic!("Expected call_failed, got {:?}", other),
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn test_invite_without_receiver_is_a_miss() {
        let fx = Fixture::new();
        let (alice, _rx) = fx.connect("c-alice", "alice");

        let routed = fx.route(
            &alice,
            Envelope::new(events::VIDEO_CALL_INVITE, json!({ "offer": {} })),
        );

        assert_eq!(
            routed.outcome,
            RouteOutcome::Missed(DeliveryError::MissingRecipient(fields::RECEIVER_ID))
        );
        match routed.reply {
            Some(Reply::Event(envelope)) => {
                assert_eq!(envelope.event, events::CALL_FAILED);
                assert!(envelope.data["receiverId"].is_null());
            }
            other => panic!("Expected call_failed, got {:?}", other),
        }
    }

    #[test]
    fn test_responses_route_to_caller() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.connect("c-alice", "alice");
        let (bob, _bob_rx) = fx.connect("c-bob", "bob");

        let routed = fx.route(
            &bob,
            Envelope::new(events::VIDEO_CALL_ACCEPTED, json!({ "callerId": "alice", "answer": "sdp" })),
        );
        assert_eq!(routed.outcome, RouteOutcome::Forwarded(alice));
        assert!(routed.reply.is_none());

        let delivered = alice_rx.try_recv().unwrap();
        assert_eq!(delivered.event, events::VIDEO_CALL_ACCEPTED);
        assert_eq!(delivered.data["answer"], "sdp");
    }

    #[test]
    fn test_responses_drop_silently_on_miss() {
        let fx = Fixture::new();
        let (bob, mut bob_rx) = fx.connect("c-bob", "bob");

        for event in [events::VIDEO_CALL_REJECTED, events::VIDEO_CALL_ACCEPTED] {
            let routed = fx.route(&bob, Envelope::new(event, json!({ "callerId": "alice" })));
            assert_eq!(routed.outcome.label(), "missed");
            assert!(routed.reply.is_none());
        }

        let routed = fx.route(&bob, Envelope::new(events::VIDEO_CALL_REJECTED, Value::Null));
        assert!(routed.reply.is_none());
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn test_message_enriched_and_acknowledged() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.connect("c-alice", "alice");
        let (_bob, mut bob_rx) = fx.connect("c-bob", "bob");

        let routed = fx.route(
            &alice,
            Envelope::new(
                events::SEND_MESSAGE,
                json!({ "senderId": "alice", "receiverId": "bob", "content": "hi" }),
            ),
        );

        let delivered = bob_rx.try_recv().unwrap();
        assert_eq!(delivered.event, events::RECEIVE_MESSAGE);
        assert_eq!(delivered.data["content"], "hi");
        assert!(delivered.data["timestamp"].is_string());

        let Some(Reply::Ack { fallback_event, data }) = routed.reply else {
            panic!("Expected an acknowledgment");
        };
        assert_eq!(fallback_event, events::MESSAGE_SENT);
        assert_eq!(data["success"], true);
        assert_eq!(data["messageId"], delivered.data["id"]);
    }

    #[test]
    fn test_message_acknowledged_when_recipient_offline() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.connect("c-alice", "alice");

        let routed = fx.route(
            &alice,
            Envelope::new(
                events::SEND_MESSAGE,
                json!({ "senderId": "alice", "receiverId": "bob", "content": "hi" }),
            ),
        );

        assert_eq!(routed.outcome.label(), "missed");
        let Some(Reply::Ack { data, .. }) = routed.reply else {
            panic!("Expected an acknowledgment");
        };
        assert_eq!(data["success"], true);
        assert!(data["messageId"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_closed_mailbox_is_a_miss() {
        let fx = Fixture::new();
        let (alice, _alice_rx) = fx.connect("c-alice", "alice");
        let (bob, bob_rx) = fx.connect("c-bob", "bob");
        drop(bob_rx);

        let routed = fx.route(
            &alice,
            Envelope::new(events::VIDEO_CALL_INVITE, json!({ "receiverId": "bob" })),
        );
        assert_eq!(
            routed.outcome,
            RouteOutcome::Missed(DeliveryError::MailboxClosed(bob))
        );
        assert!(matches!(routed.reply, Some(Reply::Event(_))));
    }

    #[test]
    fn test_echo_replies_to_sender_only() {
        let fx = Fixture::new();
        let (alice, mut alice_rx) = fx.connect("c-alice", "alice");
        let (_bob, mut bob_rx) = fx.connect("c-bob", "bob");

        let routed = fx.route(&alice, Envelope::new(events::TEST_EVENT, json!({ "x": 1 })));

        assert_eq!(routed.outcome, RouteOutcome::Echoed);
        let reply = routed.reply.unwrap().into_envelope(None);
        assert_eq!(reply.event, events::TEST_RESPONSE);
        assert_eq!(reply.data["data"], json!({ "x": 1 }));

        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn test_ack_reply_uses_request_id() {
        let reply = Reply::Ack {
            fallback_event: events::MESSAGE_SENT,
            data: json!({ "success": true }),
        };

        let envelope = reply.clone().into_envelope(Some(11));
        assert!(envelope.is_ack());
        assert_eq!(envelope.ack, Some(11));

        let envelope = reply.into_envelope(None);
        assert_eq!(envelope.event, events::MESSAGE_SENT);
        assert!(envelope.ack.is_none());
    }
}
