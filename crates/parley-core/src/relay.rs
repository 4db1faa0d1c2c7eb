//! Ephemeral signal relay.
//!
//! Signals are loss-tolerant: an offline recipient or a failed send drops
//! the signal silently and nothing is reported back to the sender.

use crate::identity::UserId;
use crate::lifecycle::LifecycleManager;
use parley_protocol::Frame;
use tracing::trace;

/// Kinds of relayed signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// The sender is typing.
    Typing,
}

impl SignalKind {
    fn frame(self, from: &UserId) -> Frame {
        match self {
            SignalKind::Typing => Frame::user_typing(from.as_str()),
        }
    }
}

/// Forwards signals to online users.
#[derive(Clone)]
pub struct SignalRelay {
    lifecycle: LifecycleManager,
}

impl SignalRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(lifecycle: LifecycleManager) -> Self {
        Self { lifecycle }
    }

    /// Forward `kind` from `from` to `to`.
    ///
    /// Returns `true` if the signal was handed to a live connection.
    pub fn relay(&self, from: &UserId, to: &str, kind: SignalKind) -> bool {
        if to.is_empty() {
            return false;
        }

        let Some(conn) = self.lifecycle.registry().lookup(&UserId::new(to)) else {
            trace!(user = %from, to, ?kind, "Signal dropped, recipient offline");
            return false;
        };

        match conn.send(kind.frame(from)) {
            Ok(()) => true,
            Err(e) => {
                self.lifecycle.evict(&conn, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CloseReason, ConnectionOutbound};
    use crate::lifecycle::tests::StaticVerifier;
    use crate::lifecycle::Session;
    use crate::presence::PresenceRegistry;
    use std::sync::Arc;

    fn setup(capacity: usize) -> (LifecycleManager, SignalRelay) {
        let lifecycle = LifecycleManager::new(
            Arc::new(PresenceRegistry::new()),
            Arc::new(StaticVerifier::new(&["alice", "bob"])),
            capacity,
        );
        let relay = SignalRelay::new(lifecycle.clone());
        (lifecycle, relay)
    }

    fn connect(lifecycle: &LifecycleManager, user: &str) -> (Session, ConnectionOutbound) {
        let mut session = lifecycle.session();
        session.authenticate(Some(&format!("token-{user}"))).unwrap();
        let mut outbound = session.activate().unwrap();
        outbound.drain();
        (session, outbound)
    }

    #[test]
    fn test_typing_reaches_online_user() {
        let (lifecycle, relay) = setup(8);
        let (_alice, mut alice_out) = connect(&lifecycle, "alice");
        let (_bob, mut bob_out) = connect(&lifecycle, "bob");
        alice_out.drain();

        assert!(relay.relay(&UserId::new("alice"), "bob", SignalKind::Typing));
        assert_eq!(bob_out.drain(), vec![Frame::user_typing("alice")]);
        assert!(alice_out.drain().is_empty());
    }

    #[test]
    fn test_typing_to_offline_user_is_silent() {
        let (lifecycle, relay) = setup(8);
        let (_alice, mut alice_out) = connect(&lifecycle, "alice");

        assert!(!relay.relay(&UserId::new("alice"), "bob", SignalKind::Typing));
        assert!(!relay.relay(&UserId::new("alice"), "", SignalKind::Typing));
        assert!(alice_out.drain().is_empty());
    }

    #[test]
    fn test_failed_signal_evicts_recipient() {
        let (lifecycle, relay) = setup(2);
        let (_alice, mut alice_out) = connect(&lifecycle, "alice");
        let (bob, bob_out) = connect(&lifecycle, "bob");
        alice_out.drain();

        let handle = bob.handle().unwrap();
        handle.send(Frame::ping()).unwrap();
        handle.send(Frame::ping()).unwrap();

        assert!(!relay.relay(&UserId::new("alice"), "bob", SignalKind::Typing));
        assert_eq!(bob_out.close_reason(), Some(CloseReason::Evicted));
        assert!(!lifecycle.registry().is_online(&UserId::new("bob")));
        assert_eq!(lifecycle.stats().evictions, 1);

        // The sender only learns that bob went away.
        assert_eq!(alice_out.drain(), vec![Frame::user_offline("bob")]);
    }
}
