//! # parley-protocol
//!
//! Wire protocol definitions for the Parley direct-message server.
//!
//! This crate defines the frames exchanged between chat clients and the
//! server, the binary and text codecs that carry them, and versioning.
//!
//! ## Frame Types
//!
//! - `SendMessage` / `Typing` - Client commands
//! - `OnlineUsers` / `UserOnline` / `UserOffline` - Presence events
//! - `ReceiveMessage` / `MessageSent` / `MessageError` - Delivery events
//! - `UserTyping` - Relayed signals
//! - `Ping` / `Pong` / `Error` - Keepalive and errors
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{Frame, codec};
//!
//! let frame = Frame::send_message("bob", "hi");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod codes;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{ChatMessage, DeliveryStatus, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
