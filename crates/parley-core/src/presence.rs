//! Presence tracking for Parley.
//!
//! The registry maps each online user to the single connection that
//! currently routes to them. It is the only state shared between
//! connection tasks; DashMap serializes mutations per key.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::identity::UserId;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Map of online users to their live connection.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    routes: DashMap<UserId, Arc<ConnectionHandle>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of online users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Check if a user is online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.routes.contains_key(user)
    }

    /// Route `conn.user()` to `conn`.
    ///
    /// Returns the connection it replaced, if any. The caller must close it.
    pub fn register(&self, conn: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let user = conn.user().clone();
        let id = conn.id();
        let previous = self
            .routes
            .insert(user.clone(), conn)
            .filter(|prev| prev.id() != id);

        debug!(
            user = %user,
            connection = %id,
            replaced = ?previous.as_ref().map(|p| p.id()),
            "Presence: registered"
        );

        previous
    }

    /// Remove the route for `user`, but only if it still points at `conn`.
    ///
    /// Returns `true` if the entry was removed.
    pub fn unregister(&self, user: &UserId, conn: &ConnectionHandle) -> bool {
        let removed = self.remove_if_current(user, conn.id());
        if removed {
            debug!(user = %user, connection = %conn.id(), "Presence: unregistered");
        } else {
            trace!(user = %user, connection = %conn.id(), "Presence: stale unregister ignored");
        }
        removed
    }

    fn remove_if_current(&self, user: &UserId, id: ConnectionId) -> bool {
        self.routes
            .remove_if(user, |_, current| current.id() == id)
            .is_some()
    }

    /// Current connection for a user.
    #[must_use]
    pub fn lookup(&self, user: &UserId) -> Option<Arc<ConnectionHandle>> {
        self.routes.get(user).map(|entry| Arc::clone(entry.value()))
    }

    /// The current online set.
    #[must_use]
    pub fn snapshot(&self) -> BTreeSet<UserId> {
        self.routes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// All live connections.
    ///
    /// The handles are cloned out so no shard lock is held while sending.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.routes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(user: &str) -> Arc<ConnectionHandle> {
        ConnectionHandle::new(UserId::new(user), 8).0
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PresenceRegistry::new();
        let alice = handle("alice");

        assert!(registry.register(Arc::clone(&alice)).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.is_online(&UserId::new("alice")));

        let found = registry.lookup(&UserId::new("alice")).unwrap();
        assert_eq!(found.id(), alice.id());
        assert!(registry.lookup(&UserId::new("bob")).is_none());
    }

    #[test]
    fn test_register_returns_previous() {
        let registry = PresenceRegistry::new();
        let first = handle("alice");
        let second = handle("alice");

        registry.register(Arc::clone(&first));
        let previous = registry.register(Arc::clone(&second)).unwrap();

        assert_eq!(previous.id(), first.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup(&UserId::new("alice")).unwrap().id(),
            second.id()
        );
    }

    #[test]
    fn test_reregister_same_connection_has_no_previous() {
        let registry = PresenceRegistry::new();
        let alice = handle("alice");

        registry.register(Arc::clone(&alice));
        assert!(registry.register(Arc::clone(&alice)).is_none());
    }

    #[test]
    fn test_unregister_is_compare_and_delete() {
        let registry = PresenceRegistry::new();
        let first = handle("alice");
        let second = handle("alice");
        let user = UserId::new("alice");

        registry.register(Arc::clone(&first));
        registry.register(Arc::clone(&second));

        // The superseded connection must not evict its replacement.
        assert!(!registry.unregister(&user, &first));
        assert!(registry.is_online(&user));

        assert!(registry.unregister(&user, &second));
        assert!(!registry.is_online(&user));
        assert!(!registry.unregister(&user, &second));
    }

    #[test]
    fn test_snapshot() {
        let registry = PresenceRegistry::new();
        registry.register(handle("bob"));
        registry.register(handle("alice"));

        let snapshot: Vec<_> = registry.snapshot().into_iter().collect();
        assert_eq!(snapshot, vec![UserId::new("alice"), UserId::new("bob")]);
        assert_eq!(registry.connections().len(), 2);
    }

    #[test]
    fn test_concurrent_registration_keeps_one_route_per_user() {
        let registry = Arc::new(PresenceRegistry::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let conn = handle("alice");
                        if let Some(previous) = registry.register(Arc::clone(&conn)) {
                            registry.unregister(previous.user(), &previous);
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
    }
}
