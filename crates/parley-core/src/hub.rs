//! The hub ties the presence registry to its lifecycle, router and relay.

use crate::identity::IdentityVerifier;
use crate::lifecycle::{LifecycleManager, LifecycleStats, Session};
use crate::presence::PresenceRegistry;
use crate::relay::SignalRelay;
use crate::router::{MessageRouter, DEFAULT_MAX_CONTENT_LENGTH};
use std::sync::Arc;
use tracing::info;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue capacity per connection, in frames.
    pub outbound_capacity: usize,
    /// Maximum message content length in bytes.
    pub max_content_length: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    /// Users currently online.
    pub online_users: usize,
    /// Lifecycle counters.
    pub lifecycle: LifecycleStats,
}

/// Owns the presence registry and hands out sessions, the router and the relay.
#[derive(Clone)]
pub struct Hub {
    lifecycle: LifecycleManager,
    router: MessageRouter,
    relay: SignalRelay,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self::with_config(verifier, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(verifier: Arc<dyn IdentityVerifier>, config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        let lifecycle = LifecycleManager::new(
            Arc::new(PresenceRegistry::new()),
            verifier,
            config.outbound_capacity,
        );
        Self {
            router: MessageRouter::new(lifecycle.clone(), config.max_content_length),
            relay: SignalRelay::new(lifecycle.clone()),
            lifecycle,
        }
    }

    /// Start a new connection session.
    #[must_use]
    pub fn session(&self) -> Session {
        self.lifecycle.session()
    }

    /// The lifecycle manager.
    #[must_use]
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// The presence registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        self.lifecycle.registry()
    }

    /// The message router.
    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// The signal relay.
    #[must_use]
    pub fn relay(&self) -> &SignalRelay {
        &self.relay
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            online_users: self.registry().len(),
            lifecycle: self.lifecycle.stats(),
        }
    }
}
