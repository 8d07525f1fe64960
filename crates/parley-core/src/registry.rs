//! Connection registry.
//!
//! Maps a logical user id to the one connection it is currently reachable
//! on. Registration is last-writer-wins: binding a user id that is already
//! bound silently replaces the old connection.

use crate::session::ConnectionId;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, trace};

/// A logical user identifier.
pub type UserId = String;

/// The user id to connection id table.
///
/// Each operation is atomic per entry, so concurrent `bind` and
/// `unbind_by_connection` calls from different sessions never leave a
/// half-written binding behind.
#[derive(Debug, Default)]
pub struct Registry {
    bindings: DashMap<UserId, ConnectionId>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection_id`, replacing any previous binding.
    ///
    /// Returns the connection that was displaced, if it differs from the new
    /// one. The displaced connection is not notified.
    pub fn bind(
        &self,
        user_id: impl Into<UserId>,
        connection_id: &ConnectionId,
    ) -> Option<ConnectionId> {
        let user_id = user_id.into();
        let previous = self.bindings.insert(user_id.clone(), connection_id.clone());

        debug!(user = %user_id, connection = %connection_id, "Bound user");

        previous.filter(|prev| prev != connection_id)
    }

    /// Look up the connection a user is reachable on.
    #[must_use]
    pub fn resolve(&self, user_id: &str) -> Option<ConnectionId> {
        let found = self.bindings.get(user_id).map(|entry| entry.value().clone());
        trace!(user = %user_id, found = found.is_some(), "Resolved user");
        found
    }

    /// Remove every binding that points at `connection_id`.
    ///
    /// Returns the user ids that were unbound. Calling this again for the
    /// same connection is a no-op.
    pub fn unbind_by_connection(&self, connection_id: &ConnectionId) -> Vec<UserId> {
        let mut removed = Vec::new();
        self.bindings.retain(|user_id, bound| {
            if bound == connection_id {
                removed.push(user_id.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            debug!(connection = %connection_id, users = ?removed, "Unbound connection");
        }

        removed
    }

    /// Snapshot of all registered user ids.
    #[must_use]
    pub fn users(&self) -> Vec<UserId> {
        self.bindings.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered user ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no user is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let connections: HashSet<ConnectionId> =
            self.bindings.iter().map(|e| e.value().clone()).collect();

        RegistryStats {
            registered_users: self.bindings.len(),
            bound_connections: connections.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered user ids.
    pub registered_users: usize,
    /// Number of distinct connections holding at least one binding.
    pub bound_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_last_bind_wins() {
        let registry = Registry::new();

        assert_eq!(registry.bind("alice", &conn("c1")), None);
        assert_eq!(registry.bind("alice", &conn("c2")), Some(conn("c1")));

        assert_eq!(registry.resolve("alice"), Some(conn("c2")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rebind_same_connection_displaces_nothing() {
        let registry = Registry::new();

        registry.bind("alice", &conn("c1"));
        assert_eq!(registry.bind("alice", &conn("c1")), None);
        assert_eq!(registry.resolve("alice"), Some(conn("c1")));
    }

    #[test]
    fn test_resolve_unknown_user() {
        let registry = Registry::new();
        registry.bind("alice", &conn("c1"));

        assert_eq!(registry.resolve("carol"), None);
    }

    #[test]
    fn test_unbind_by_connection_is_idempotent() {
        let registry = Registry::new();
        registry.bind("alice", &conn("c1"));
        registry.bind("bob", &conn("c2"));

        assert_eq!(registry.unbind_by_connection(&conn("c1")), vec!["alice"]);
        assert_eq!(registry.resolve("alice"), None);
        assert_eq!(registry.resolve("bob"), Some(conn("c2")));

        assert!(registry.unbind_by_connection(&conn("c1")).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unbind_removes_every_alias_of_a_connection() {
        let registry = Registry::new();
        registry.bind("alice", &conn("c1"));
        registry.bind("alice-phone", &conn("c1"));

        let mut removed = registry.unbind_by_connection(&conn("c1"));
        removed.sort();
        assert_eq!(removed, vec!["alice", "alice-phone"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unbind_displaced_connection_keeps_new_binding() {
        let registry = Registry::new();
        registry.bind("alice", &conn("c1"));
        registry.bind("alice", &conn("c2"));

        // The stale session disconnecting must not evict its replacement.
        assert!(registry.unbind_by_connection(&conn("c1")).is_empty());
        assert_eq!(registry.resolve("alice"), Some(conn("c2")));
    }

    #[test]
    fn test_stats() {
        let registry = Registry::new();
        registry.bind("alice", &conn("c1"));
        registry.bind("alice-tab", &conn("c1"));
        registry.bind("bob", &conn("c2"));

        assert_eq!(
            registry.stats(),
            RegistryStats {
                registered_users: 3,
                bound_connections: 2,
            }
        );
    }

    #[test]
    fn test_concurrent_bind_and_unbind() {
        let registry = Arc::new(Registry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let c = conn(&format!("c{i}"));
                    for round in 0..200 {
                        registry.bind(format!("user-{i}-{round}"), &c);
                        registry.bind("shared", &c);
                    }
                    registry.unbind_by_connection(&c);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_empty());
    }
}
