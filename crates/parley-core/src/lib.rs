//! # parley-core
//!
//! Presence, connection lifecycle and direct-message routing for Parley.
//!
//! This crate provides the building blocks of the server:
//!
//! - **Identity** - Who is on the other end of a connection (JWT-backed)
//! - **Presence** - Which connection currently routes to each online user
//! - **Lifecycle** - `Connecting → Authenticated → Active → Closed`
//! - **Router** - One-to-one message delivery with status confirmation
//! - **Relay** - Loss-tolerant signals such as typing
//! - **Archive** - Storage collaborator for conversation history
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│  Lifecycle  │────▶│  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            ▲                   ▲
//!                            │                   │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Router    │     │    Relay    │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod archive;
pub mod auth;
pub mod connection;
pub mod hub;
pub mod identity;
pub mod lifecycle;
pub mod message;
pub mod presence;
pub mod relay;
pub mod router;

pub use archive::{ArchiveError, MemoryArchive, MessageArchive, StoredId};
pub use auth::{Claims, JwtVerifier};
pub use connection::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionOutbound, DeliveryError, Outgoing,
};
pub use hub::{Hub, HubConfig, HubStats};
pub use identity::{AuthError, AuthFailure, IdentityVerifier, UserId};
pub use lifecycle::{ConnectionState, LifecycleError, LifecycleEvent, LifecycleManager, Session};
pub use message::{Message, MessageId};
pub use presence::PresenceRegistry;
pub use relay::{SignalKind, SignalRelay};
pub use router::{Delivery, MessageRouter, RouteError, Routed};
