//! Connection lifecycle management.
//!
//! Every connection walks `Connecting → Authenticated → Active → Closed`.
//! The allowed transitions live in one table ([`ConnectionState::on`]);
//! [`Session`] drives a single connection through it and the
//! [`LifecycleManager`] applies the registry mutations and presence
//! broadcasts that each transition implies.

use crate::connection::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionOutbound, DeliveryError,
};
use crate::identity::{AuthError, IdentityVerifier, UserId};
use crate::presence::PresenceRegistry;
use parking_lot::{Mutex, MutexGuard};
use parley_protocol::Frame;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, credential not yet checked.
    Connecting,
    /// Credential verified, not yet routable.
    Authenticated,
    /// Registered in the presence registry.
    Active,
    /// Terminal.
    Closed,
}

/// Events that move a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The identity verifier accepted the credential.
    Verified,
    /// The identity verifier refused the credential.
    Rejected,
    /// The connection was registered as its user's route.
    Registered,
    /// The client went away cleanly.
    Disconnected,
    /// The transport failed or timed out.
    TransportError,
    /// A newer connection for the same user took over.
    Superseded,
    /// A send to this connection failed and it was dropped.
    Evicted,
}

impl From<CloseReason> for LifecycleEvent {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Superseded => LifecycleEvent::Superseded,
            CloseReason::Evicted => LifecycleEvent::Evicted,
        }
    }
}

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The event is not allowed in the current state.
    #[error("Invalid lifecycle transition from {state:?} on {event:?}")]
    InvalidTransition {
        state: ConnectionState,
        event: LifecycleEvent,
    },

    /// Authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ConnectionState {
    /// Apply an event, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] for any pair not in the table.
    pub fn on(self, event: LifecycleEvent) -> Result<Self, LifecycleError> {
        use ConnectionState::*;
        use LifecycleEvent::*;

        match (self, event) {
            (Connecting, Verified) => Ok(Authenticated),
            (Connecting, Rejected) => Ok(Closed),
            (Authenticated, Registered) => Ok(Active),
            (Connecting | Authenticated | Active, Disconnected | TransportError) => Ok(Closed),
            (Active, Superseded | Evicted) => Ok(Closed),
            (state, event) => Err(LifecycleError::InvalidTransition { state, event }),
        }
    }

    /// Check if this is the terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Lifecycle counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleStats {
    /// Connections that reached `Active`.
    pub activations: u64,
    /// Connections closed because a newer one replaced them.
    pub supersessions: u64,
    /// Connections dropped after a failed send.
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    activations: AtomicU64,
    supersessions: AtomicU64,
    evictions: AtomicU64,
}

const PRESENCE_STRIPES: usize = 64;

/// Striped per-user locks.
///
/// A registry change for a user and the presence fan-out it causes happen
/// under that user's stripe, so peers see a user's events in registry
/// order. At most one stripe is held at a time.
struct PresenceLocks([Mutex<()>; PRESENCE_STRIPES]);

impl PresenceLocks {
    fn new() -> Self {
        Self(std::array::from_fn(|_| Mutex::new(())))
    }

    fn lock(&self, user: &UserId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        user.hash(&mut hasher);
        self.0[(hasher.finish() % PRESENCE_STRIPES as u64) as usize].lock()
    }
}

/// Owns registration and deregistration around the presence registry.
///
/// Cheap to clone; clones share the registry and counters.
#[derive(Clone)]
pub struct LifecycleManager {
    registry: Arc<PresenceRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    outbound_capacity: usize,
    counters: Arc<Counters>,
    locks: Arc<PresenceLocks>,
}

impl LifecycleManager {
    /// Create a lifecycle manager.
    #[must_use]
    pub fn new(
        registry: Arc<PresenceRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            registry,
            verifier,
            outbound_capacity,
            counters: Arc::new(Counters::default()),
            locks: Arc::new(PresenceLocks::new()),
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// The identity verifier.
    #[must_use]
    pub fn verifier(&self) -> &Arc<dyn IdentityVerifier> {
        &self.verifier
    }

    /// Start a new session in `Connecting`.
    #[must_use]
    pub fn session(&self) -> Session {
        Session {
            manager: self.clone(),
            state: ConnectionState::Connecting,
            user: None,
            handle: None,
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            activations: self.counters.activations.load(Ordering::Relaxed),
            supersessions: self.counters.supersessions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Register a new connection for `user` and announce it.
    fn activate(&self, user: UserId) -> (Arc<ConnectionHandle>, ConnectionOutbound) {
        let (handle, outbound) = ConnectionHandle::new(user, self.outbound_capacity);
        let user = handle.user();
        let mut failed = Vec::new();

        {
            let _presence = self.locks.lock(user);

            if let Some(previous) = self.registry.register(Arc::clone(&handle)) {
                if previous.close(CloseReason::Superseded) {
                    self.counters.supersessions.fetch_add(1, Ordering::Relaxed);
                }
                info!(
                    user = %user,
                    connection = %handle.id(),
                    superseded = %previous.id(),
                    "Connection superseded"
                );
            }
            self.counters.activations.fetch_add(1, Ordering::Relaxed);
            info!(user = %user, connection = %handle.id(), "User connected");

            let snapshot = self.registry.snapshot();
            if let Err(e) = handle.send(Frame::online_users(snapshot.iter().map(UserId::as_str))) {
                warn!(user = %user, error = %e, "Failed to send online snapshot");
                failed.push(Arc::clone(&handle));
            }
            failed.extend(self.fan_out(&Frame::user_online(user.as_str()), handle.id()));
        }

        self.evict_all(failed);
        (handle, outbound)
    }

    /// Unregister `handle` and announce its user offline as one step.
    ///
    /// Returns `None` if it was no longer its user's route, otherwise the
    /// peers the announcement failed to reach.
    fn withdraw(&self, handle: &ConnectionHandle) -> Option<Vec<Arc<ConnectionHandle>>> {
        let _presence = self.locks.lock(handle.user());
        if !self.registry.unregister(handle.user(), handle) {
            return None;
        }
        Some(self.fan_out(&Frame::user_offline(handle.user().as_str()), handle.id()))
    }

    /// Remove a closing connection from the registry.
    ///
    /// Broadcasts `user_offline` only if this connection was still its
    /// user's route. Returns whether the registry entry was removed.
    fn deactivate(&self, handle: &ConnectionHandle) -> bool {
        let withdrawn = self.withdraw(handle);
        handle.mark_closed();

        match withdrawn {
            Some(failed) => {
                info!(user = %handle.user(), connection = %handle.id(), "User disconnected");
                self.evict_all(failed);
                true
            }
            None => {
                debug!(
                    user = %handle.user(),
                    connection = %handle.id(),
                    "Superseded connection closed"
                );
                false
            }
        }
    }

    /// Drop a connection that could not accept a send.
    ///
    /// A connection that is already closed is left to its own task. Returns
    /// whether it was still registered.
    pub fn evict(&self, handle: &Arc<ConnectionHandle>, error: DeliveryError) -> bool {
        if error == DeliveryError::Closed {
            debug!(user = %handle.user(), connection = %handle.id(), "Send to closing connection");
            return false;
        }

        warn!(
            user = %handle.user(),
            connection = %handle.id(),
            error = %error,
            "Evicting connection"
        );
        let withdrawn = self.withdraw(handle);
        handle.close(CloseReason::Evicted);

        match withdrawn {
            Some(failed) => {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.evict_all(failed);
                true
            }
            None => false,
        }
    }

    /// Evict connections iteratively; each eviction may reveal more failures.
    fn evict_all(&self, mut queue: Vec<Arc<ConnectionHandle>>) {
        while let Some(handle) = queue.pop() {
            handle.close(CloseReason::Evicted);
            if let Some(failed) = self.withdraw(&handle) {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                warn!(user = %handle.user(), connection = %handle.id(), "Evicted connection");
                queue.extend(failed);
            }
        }
    }

    /// Best-effort send to every live connection except `except`.
    ///
    /// Returns the peers whose send failed.
    fn fan_out(&self, frame: &Frame, except: ConnectionId) -> Vec<Arc<ConnectionHandle>> {
        let mut failed = Vec::new();
        for peer in self.registry.connections() {
            if peer.id() == except {
                continue;
            }
            if let Err(e) = peer.send(frame.clone()) {
                debug!(user = %peer.user(), connection = %peer.id(), error = %e, "Broadcast failed");
                failed.push(peer);
            }
        }
        failed
    }
}

/// Drives one connection through its lifecycle.
///
/// Dropping an `Active` session closes it, so a connection task that ends
/// for any reason never leaves a stale registry entry behind.
pub struct Session {
    manager: LifecycleManager,
    state: ConnectionState,
    user: Option<UserId>,
    handle: Option<Arc<ConnectionHandle>>,
}

impl Session {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Authenticated user, once known.
    #[must_use]
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    /// The registered connection handle, once active.
    #[must_use]
    pub fn handle(&self) -> Option<&Arc<ConnectionHandle>> {
        self.handle.as_ref()
    }

    /// Verify the connection credential.
    ///
    /// On failure the session is `Closed` and nothing was registered.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Auth`] if verification fails, or
    /// [`LifecycleError::InvalidTransition`] if not `Connecting`.
    pub fn authenticate(&mut self, credential: Option<&str>) -> Result<UserId, LifecycleError> {
        if self.state != ConnectionState::Connecting {
            return Err(LifecycleError::InvalidTransition {
                state: self.state,
                event: LifecycleEvent::Verified,
            });
        }

        match self.manager.verifier.verify(credential) {
            Ok(user) => {
                self.state = self.state.on(LifecycleEvent::Verified)?;
                debug!(user = %user, "Connection authenticated");
                self.user = Some(user.clone());
                Ok(user)
            }
            Err(e) => {
                self.state = self.state.on(LifecycleEvent::Rejected)?;
                warn!(error = %e, "Connection rejected");
                Err(LifecycleError::Auth(e))
            }
        }
    }

    /// Register the connection and announce it.
    ///
    /// Returns the receiving side of the connection's outbound queue. The
    /// online-set snapshot is already queued on it.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] if not `Authenticated`.
    pub fn activate(&mut self) -> Result<ConnectionOutbound, LifecycleError> {
        let next = self.state.on(LifecycleEvent::Registered)?;
        let Some(user) = self.user.clone() else {
            return Err(LifecycleError::InvalidTransition {
                state: self.state,
                event: LifecycleEvent::Registered,
            });
        };

        let (handle, outbound) = self.manager.activate(user);
        self.handle = Some(handle);
        self.state = next;
        Ok(outbound)
    }

    /// Close the session.
    ///
    /// Returns whether the registry entry was removed (and `user_offline`
    /// broadcast).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] if already closed or
    /// the event is not a close event for the current state.
    pub fn close(&mut self, event: LifecycleEvent) -> Result<bool, LifecycleError> {
        let next = self.state.on(event)?;
        let was_active = self.state == ConnectionState::Active;
        self.state = next;

        match &self.handle {
            Some(handle) if was_active => Ok(self.manager.deactivate(handle)),
            _ => Ok(false),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == ConnectionState::Active {
            let _ = self.close(LifecycleEvent::Disconnected);
        }
    }
}
