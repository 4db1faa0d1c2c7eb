//! Frame types for the Parley protocol.
//!
//! Frames are the fundamental unit of communication between a chat client
//! and the server. Binary connections carry them as MessagePack, text
//! connections as JSON; both use the same `"type"` tag.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    SendMessage = 0x01,
    Typing = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Connected = 0x10,
    OnlineUsers = 0x11,
    UserOnline = 0x12,
    UserOffline = 0x13,
    ReceiveMessage = 0x14,
    MessageSent = 0x15,
    MessageError = 0x16,
    UserTyping = 0x17,
    Error = 0x1F,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::SendMessage),
            0x02 => Ok(FrameType::Typing),
            0x03 => Ok(FrameType::Ping),
            0x04 => Ok(FrameType::Pong),
            0x10 => Ok(FrameType::Connected),
            0x11 => Ok(FrameType::OnlineUsers),
            0x12 => Ok(FrameType::UserOnline),
            0x13 => Ok(FrameType::UserOffline),
            0x14 => Ok(FrameType::ReceiveMessage),
            0x15 => Ok(FrameType::MessageSent),
            0x16 => Ok(FrameType::MessageError),
            0x17 => Ok(FrameType::UserTyping),
            0x1F => Ok(FrameType::Error),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Delivery state stamped on a message by the server at routing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by the server; the recipient was not reachable.
    Sent,
    /// Handed to the recipient's live connection.
    Delivered,
    /// Routing failed inside the server.
    Error,
}

impl DeliveryStatus {
    /// Lower-case name, as used on the wire and in metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A direct message as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned message identifier.
    pub id: u64,
    /// Sender user ID.
    pub from: String,
    /// Recipient user ID.
    pub to: String,
    /// Message text.
    pub content: String,
    /// Unix timestamp in milliseconds, assigned once by the server.
    pub timestamp: u64,
    /// Delivery status at routing time.
    pub status: DeliveryStatus,
}

/// A protocol frame.
///
/// The first four variants flow from client to server; the rest are
/// emitted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Send a direct message to another user.
    #[serde(rename = "send_message")]
    SendMessage {
        /// Optional client request ID, echoed in the confirmation.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Recipient user ID.
        to: String,
        /// Message text.
        content: String,
    },

    /// Tell another user we are typing.
    #[serde(rename = "typing")]
    Typing {
        /// Recipient user ID.
        to: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Authenticated user ID.
        user_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Full snapshot of the online set, sent once on activation.
    #[serde(rename = "online_users")]
    OnlineUsers {
        /// Online user IDs.
        users: Vec<String>,
    },

    /// A user came online.
    #[serde(rename = "user_online")]
    UserOnline {
        /// The user that connected.
        user_id: String,
    },

    /// A user went offline.
    #[serde(rename = "user_offline")]
    UserOffline {
        /// The user that disconnected.
        user_id: String,
    },

    /// A message addressed to this user.
    #[serde(rename = "receive_message")]
    ReceiveMessage {
        /// The delivered message.
        message: ChatMessage,
    },

    /// Confirmation of a message this user sent.
    #[serde(rename = "message_sent")]
    MessageSent {
        /// Client request ID from the `send_message` frame.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// The routed message with its resolved status.
        message: ChatMessage,
    },

    /// A message could not be routed.
    #[serde(rename = "message_error")]
    MessageError {
        /// Client request ID from the `send_message` frame.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Human-readable reason.
        reason: String,
    },

    /// Another user is typing to this user.
    #[serde(rename = "user_typing")]
    UserTyping {
        /// The typing user.
        from: String,
    },

    /// Protocol or connection error.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`crate::codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::SendMessage { .. } => FrameType::SendMessage,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::OnlineUsers { .. } => FrameType::OnlineUsers,
            Frame::UserOnline { .. } => FrameType::UserOnline,
            Frame::UserOffline { .. } => FrameType::UserOffline,
            Frame::ReceiveMessage { .. } => FrameType::ReceiveMessage,
            Frame::MessageSent { .. } => FrameType::MessageSent,
            Frame::MessageError { .. } => FrameType::MessageError,
            Frame::UserTyping { .. } => FrameType::UserTyping,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Whether a client is allowed to send this frame.
    #[must_use]
    pub fn is_client_frame(&self) -> bool {
        matches!(
            self,
            Frame::SendMessage { .. } | Frame::Typing { .. } | Frame::Ping { .. } | Frame::Pong { .. }
        )
    }

    /// Create a new SendMessage frame.
    #[must_use]
    pub fn send_message(to: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::SendMessage {
            id: None,
            to: to.into(),
            content: content.into(),
        }
    }

    /// Create a new SendMessage frame with a request ID.
    #[must_use]
    pub fn send_message_with_id(
        id: u64,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Frame::SendMessage {
            id: Some(id),
            to: to.into(),
            content: content.into(),
        }
    }

    /// Create a new Typing frame.
    #[must_use]
    pub fn typing(to: impl Into<String>) -> Self {
        Frame::Typing { to: to.into() }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new OnlineUsers frame.
    #[must_use]
    pub fn online_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Frame::OnlineUsers {
            users: users.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a new UserOnline frame.
    #[must_use]
    pub fn user_online(user_id: impl Into<String>) -> Self {
        Frame::UserOnline {
            user_id: user_id.into(),
        }
    }

    /// Create a new UserOffline frame.
    #[must_use]
    pub fn user_offline(user_id: impl Into<String>) -> Self {
        Frame::UserOffline {
            user_id: user_id.into(),
        }
    }

    /// Create a new ReceiveMessage frame.
    #[must_use]
    pub fn receive_message(message: ChatMessage) -> Self {
        Frame::ReceiveMessage { message }
    }

    /// Create a new MessageSent frame.
    #[must_use]
    pub fn message_sent(id: Option<u64>, message: ChatMessage) -> Self {
        Frame::MessageSent { id, message }
    }

    /// Create a new MessageError frame.
    #[must_use]
    pub fn message_error(id: Option<u64>, reason: impl Into<String>) -> Self {
        Frame::MessageError {
            id,
            reason: reason.into(),
        }
    }

    /// Create a new UserTyping frame.
    #[must_use]
    pub fn user_typing(from: impl Into<String>) -> Self {
        Frame::UserTyping { from: from.into() }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }
}
