//! Message archive collaborator.
//!
//! Routing never depends on the archive; the server appends each routed
//! message after the fact and serves conversation history from it.

use crate::identity::UserId;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;

/// Identifier assigned by an archive to a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoredId(pub u64);

impl fmt::Display for StoredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Archive errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The backing store could not be reached.
    #[error("Archive unavailable: {0}")]
    Unavailable(String),
}

/// Durable (or not) storage of routed messages.
#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// Store a message.
    async fn append(&self, message: &Message) -> Result<StoredId, ArchiveError>;

    /// The conversation between `a` and `b`, oldest first.
    async fn list_between(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, ArchiveError>;
}

/// Bounded in-memory archive. The oldest messages are dropped past capacity.
#[derive(Debug)]
pub struct MemoryArchive {
    messages: RwLock<VecDeque<Message>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl MemoryArchive {
    /// Create an archive holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored messages.
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Check if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl MessageArchive for MemoryArchive {
    async fn append(&self, message: &Message) -> Result<StoredId, ArchiveError> {
        let id = StoredId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut messages = self.messages.write().await;
        if messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(message.clone());

        trace!(stored = %id, message = message.id, "Message archived");
        Ok(id)
    }

    async fn list_between(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>, ArchiveError> {
        let mut conversation: Vec<Message> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect();

        conversation.sort_by_key(|m| (m.timestamp, m.id));
        Ok(conversation)
    }
}
