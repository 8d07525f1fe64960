//! # parley-core
//!
//! Presence registry, event routing, and session lifecycle for the Parley
//! signaling relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Which user id is reachable on which connection
//! - **Session** - Per-connection state and outbound mailboxes
//! - **Router** - Directed forwarding with per-event miss policies
//! - **Lifecycle** - Accept, registration, dispatch and teardown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│  Lifecycle  │────▶│   Router    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│  Mailboxes  │◀────│  Registry   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! The transport owns the socket; everything in this crate is
//! transport-agnostic and exchanges [`parley_protocol::Envelope`]s.

pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod router;
pub mod session;

pub use lifecycle::{Dispatch, Handled, Lifecycle};
pub use message::{generate_message_id, MessageId};
pub use registry::{Registry, RegistryStats, UserId};
pub use router::{DeliveryError, Reply, Route, RouteOutcome, Routed, Router};
pub use session::{ConnectionId, Mailbox, Mailboxes, Session, SessionState};
