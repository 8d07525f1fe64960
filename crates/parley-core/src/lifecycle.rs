//! Connection lifecycle management.
//!
//! The lifecycle manager opens a session for every accepted connection,
//! dispatches its inbound events, and tears it down on disconnect.
//!
//! ```text
//! CONNECTED ──register──▶ REGISTERED ──┐
//!     │                      ▲  │      │ register (again)
//!     │                      └──┼──────┘
//!     └──────── close ──────────┴────▶ CLOSED
//! ```

use crate::registry::{Registry, UserId};
use crate::router::{Route, RouteOutcome, Router, DEFAULT_ROUTES};
use crate::session::{ConnectionId, Mailbox, Mailboxes, Session};
use parley_protocol::events::{self, fields};
use parley_protocol::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What an inbound event name triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Bind the payload's `userId` to the session.
    Register,
    /// Hand the event to the router.
    Route(Route),
}

/// Result of handling one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// The session was bound to `user_id`.
    Registered {
        user_id: UserId,
        displaced: Option<ConnectionId>,
    },
    /// A registration without a usable user id. The session is unchanged.
    RegistrationIgnored,
    /// The event went through the router.
    Routed {
        route: Route,
        outcome: RouteOutcome,
        reply: Option<Envelope>,
    },
    /// No handler for this event name.
    Unknown,
    /// The session is already closed.
    SessionClosed,
}

impl Handled {
    /// Take the reply owed to the sender, if any.
    #[must_use]
    pub fn into_reply(self) -> Option<Envelope> {
        match self {
            Handled::Routed { reply, .. } => reply,
            _ => None,
        }
    }

    /// Short result name for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Handled::Registered { .. } => "registered",
            Handled::RegistrationIgnored => "registration_ignored",
            Handled::Routed { outcome, .. } => outcome.label(),
            Handled::Unknown => "unknown",
            Handled::SessionClosed => "session_closed",
        }
    }
}

/// Owns every session from accept to teardown.
pub struct Lifecycle {
    registry: Arc<Registry>,
    mailboxes: Arc<Mailboxes>,
    router: Router,
    dispatch: HashMap<&'static str, Dispatch>,
}

impl Lifecycle {
    /// Create a lifecycle manager over `registry` with the default event
    /// table.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        let mailboxes = Arc::new(Mailboxes::new());
        let router = Router::new(Arc::clone(&registry), Arc::clone(&mailboxes));

        let mut lifecycle = Self {
            registry,
            mailboxes,
            router,
            dispatch: HashMap::new(),
        };

        for name in events::REGISTRATION_EVENTS {
            lifecycle.on(name, Dispatch::Register);
        }
        for (name, route) in DEFAULT_ROUTES {
            lifecycle.on(name, Dispatch::Route(route));
        }

        lifecycle
    }

    /// Register a handler for an inbound event name, replacing any existing
    /// one.
    pub fn on(&mut self, event: &'static str, dispatch: Dispatch) {
        self.dispatch.insert(event, dispatch);
    }

    /// The handler for an event name, if any.
    #[must_use]
    pub fn dispatch_for(&self, event: &str) -> Option<Dispatch> {
        self.dispatch.get(event).copied()
    }

    /// The shared registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Open a session for a newly accepted connection.
    #[must_use]
    pub fn open(&self) -> (Session, Mailbox) {
        self.open_with_id(ConnectionId::generate())
    }

    /// Open a session under a transport-assigned connection id.
    #[must_use]
    pub fn open_with_id(&self, id: ConnectionId) -> (Session, Mailbox) {
        let mailbox = self.mailboxes.open(&id);
        debug!(connection = %id, "Session opened");
        (Session::new(id), mailbox)
    }

    /// Handle one inbound event on `session`.
    ///
    /// Events are handled to completion; the returned value carries the reply
    /// owed to the sender, if any.
    pub fn handle(&self, session: &mut Session, envelope: Envelope) -> Handled {
        if session.is_closed() {
            debug!(connection = %session.id(), event = %envelope.event, "Event on closed session");
            return Handled::SessionClosed;
        }

        match self.dispatch_for(&envelope.event) {
            Some(Dispatch::Register) => self.register(session, &envelope),
            Some(Dispatch::Route(route)) => {
                let ack = envelope.ack;
                let routed = self.router.route(session.id(), route, envelope);
                Handled::Routed {
                    route,
                    outcome: routed.outcome,
                    reply: routed.reply.map(|reply| reply.into_envelope(ack)),
                }
            }
            None => {
                debug!(connection = %session.id(), event = %envelope.event, "Ignoring unknown event");
                Handled::Unknown
            }
        }
    }

    fn register(&self, session: &mut Session, envelope: &Envelope) -> Handled {
        let Some(user_id) = envelope.user_field(fields::USER_ID) else {
            debug!(connection = %session.id(), event = %envelope.event, "Registration without userId");
            return Handled::RegistrationIgnored;
        };

        let displaced = self.registry.bind(user_id.clone(), session.id());
        if let Some(previous) = &displaced {
            debug!(
                user = %user_id,
                previous = %previous,
                connection = %session.id(),
                "Registration replaced an existing binding"
            );
        }

        session.mark_registered(user_id.clone());
        info!(user = %user_id, connection = %session.id(), "User registered");

        Handled::Registered { user_id, displaced }
    }

    /// Tear a session down, removing its registry bindings.
    ///
    /// Safe to call more than once; only the first call has an effect.
    /// Returns the user ids that were unbound.
    pub fn close(&self, session: &mut Session) -> Vec<UserId> {
        if !session.mark_closed() {
            return Vec::new();
        }

        // Close the mailbox first so routing during cleanup misses instead
        // of queueing into a dead session.
        self.mailboxes.close(session.id());
        let removed = self.registry.unbind_by_connection(session.id());

        info!(
            connection = %session.id(),
            unbound = ?removed,
            remaining = self.registry.len(),
            online = ?self.registry.users(),
            "Session closed"
        );

        removed
    }
}
