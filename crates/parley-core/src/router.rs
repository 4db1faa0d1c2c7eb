//! Direct-message routing.
//!
//! The router stamps a message once, hands it to the recipient's live
//! connection if there is one, and always echoes the resolved message back
//! to the sender. An offline recipient is a normal outcome, not an error.

use crate::connection::{ConnectionHandle, DeliveryError};
use crate::identity::UserId;
use crate::lifecycle::LifecycleManager;
use crate::message::Message;
use parley_protocol::{DeliveryStatus, Frame};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default maximum message content length in bytes.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 64 * 1024;

/// Reasons a message could not be routed at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No recipient given.
    #[error("Recipient is required")]
    MissingRecipient,

    /// Empty message body.
    #[error("Message content is empty")]
    EmptyContent,

    /// Message body over the configured limit.
    #[error("Message content is {len} bytes, limit is {max}")]
    ContentTooLong { len: usize, max: usize },
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the recipient's live connection.
    Delivered,
    /// The recipient had no live connection.
    RecipientOffline,
    /// The recipient's connection failed the send and was evicted.
    Evicted,
}

impl Delivery {
    /// Delivery status reported for this outcome.
    #[must_use]
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Delivery::Delivered => DeliveryStatus::Delivered,
            Delivery::RecipientOffline | Delivery::Evicted => DeliveryStatus::Sent,
        }
    }
}

/// A message after routing.
#[derive(Debug, Clone)]
pub struct Routed {
    /// The message, with its resolved status.
    pub message: Message,
    /// The routing outcome.
    pub delivery: Delivery,
}

/// Routes direct messages between online users.
#[derive(Clone)]
pub struct MessageRouter {
    lifecycle: LifecycleManager,
    max_content_length: usize,
}

impl MessageRouter {
    /// Create a router.
    #[must_use]
    pub fn new(lifecycle: LifecycleManager, max_content_length: usize) -> Self {
        Self {
            lifecycle,
            max_content_length,
        }
    }

    /// Check a message before stamping it.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] for an empty recipient, empty content, or
    /// content over the limit.
    pub fn validate(&self, to: &str, content: &str) -> Result<(), RouteError> {
        if to.trim().is_empty() {
            return Err(RouteError::MissingRecipient);
        }
        if content.trim().is_empty() {
            return Err(RouteError::EmptyContent);
        }
        if content.len() > self.max_content_length {
            return Err(RouteError::ContentTooLong {
                len: content.len(),
                max: self.max_content_length,
            });
        }
        Ok(())
    }

    /// Route a message from the user behind `origin` to `to`.
    ///
    /// `request_id` is the client's correlation ID and is echoed in the
    /// sender's confirmation or error.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] if the message is invalid; the sender has
    /// already been sent a `message_error` and nothing was delivered.
    pub fn route(
        &self,
        origin: &Arc<ConnectionHandle>,
        to: &str,
        content: &str,
        request_id: Option<u64>,
    ) -> Result<Routed, RouteError> {
        if let Err(e) = self.validate(to, content) {
            debug!(user = %origin.user(), to, error = %e, "Message rejected");
            self.reply(origin, Frame::message_error(request_id, e.to_string()));
            return Err(e);
        }

        let recipient = UserId::new(to);
        let message = Message::new(origin.user().clone(), recipient, content);
        let (message, delivery) = self.deliver(message);

        trace!(
            user = %message.from,
            to = %message.to,
            id = message.id,
            ?delivery,
            "Message routed"
        );
        self.reply(origin, Frame::message_sent(request_id, message.to_wire()));

        Ok(Routed { message, delivery })
    }

    /// Hand the message to the recipient if they are online.
    fn deliver(&self, message: Message) -> (Message, Delivery) {
        let Some(conn) = self.lifecycle.registry().lookup(&message.to) else {
            return (message, Delivery::RecipientOffline);
        };

        let delivered = message.with_status(DeliveryStatus::Delivered);
        match conn.send(Frame::receive_message(delivered.to_wire())) {
            Ok(()) => (delivered, Delivery::Delivered),
            Err(DeliveryError::Closed) => (
                delivered.with_status(DeliveryStatus::Sent),
                Delivery::RecipientOffline,
            ),
            Err(e) => {
                self.lifecycle.evict(&conn, e);
                (
                    delivered.with_status(DeliveryStatus::Sent),
                    Delivery::Evicted,
                )
            }
        }
    }

    fn reply(&self, origin: &Arc<ConnectionHandle>, frame: Frame) {
        if let Err(e) = origin.send(frame) {
            warn!(user = %origin.user(), connection = %origin.id(), error = %e, "Sender unreachable");
            self.lifecycle.evict(origin, e);
        }
    }
}
