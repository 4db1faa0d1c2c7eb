//! Direct messages as routed by the core.
//!
//! A message is stamped once (ID, timestamp, status) at routing time; both
//! the recipient's copy and the sender's confirmation are rendered from
//! that single value.

use crate::identity::UserId;
use parley_protocol::{ChatMessage, DeliveryStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs within the same millisecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Upper bits: milliseconds, lower 20 bits: counter
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xF_FFFF;
    (now_millis() << 20) | counter
}

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Sender.
    pub from: UserId,
    /// Recipient.
    pub to: UserId,
    /// Message text.
    pub content: String,
    /// Unix milliseconds when the message was routed.
    pub timestamp: u64,
    /// Delivery status decided at routing time.
    pub status: DeliveryStatus,
}

impl Message {
    /// Create a new message with status `sent`.
    #[must_use]
    pub fn new(from: UserId, to: UserId, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            from,
            to,
            content: content.into(),
            timestamp: now_millis(),
            status: DeliveryStatus::Sent,
        }
    }

    /// Set the delivery status.
    #[must_use]
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = status;
        self
    }

    /// Check whether this message belongs to the conversation of `a` and `b`.
    #[must_use]
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (&self.from == a && &self.to == b) || (&self.from == b && &self.to == a)
    }

    /// Render the message for the wire.
    #[must_use]
    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage::from(self)
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        ChatMessage {
            id: message.id,
            from: message.from.to_string(),
            to: message.to.to_string(),
            content: message.content.clone(),
            timestamp: message.timestamp,
            status: message.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(UserId::new("alice"), UserId::new("bob"), "hello");
        assert_eq!(msg.from.as_str(), "alice");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_is_between() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let carol = UserId::new("carol");
        let msg = Message::new(alice.clone(), bob.clone(), "hi");

        assert!(msg.is_between(&alice, &bob));
        assert!(msg.is_between(&bob, &alice));
        assert!(!msg.is_between(&alice, &carol));
    }

    #[test]
    fn test_to_wire_keeps_stamp() {
        let msg = Message::new(UserId::new("alice"), UserId::new("bob"), "hi")
            .with_status(DeliveryStatus::Delivered);
        let wire = msg.to_wire();

        assert_eq!(wire.id, msg.id);
        assert_eq!(wire.timestamp, msg.timestamp);
        assert_eq!(wire.status, DeliveryStatus::Delivered);
        assert_eq!(wire.to, "bob");
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
    }
}
