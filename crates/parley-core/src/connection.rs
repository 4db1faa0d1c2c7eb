//! Connection handles and per-connection outbound queues.
//!
//! A [`ConnectionHandle`] is the send-capable side of one live transport
//! session. It is shared (via `Arc`) between the presence registry and the
//! task that owns the socket; the task keeps the matching
//! [`ConnectionOutbound`] and drains it in FIFO order.

use crate::identity::UserId;
use parley_protocol::{codes, Frame};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

/// Why a connection was closed from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered for the same user.
    Superseded,
    /// A send to this connection failed.
    Evicted,
}

impl CloseReason {
    /// Close code reported to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Superseded => codes::SUPERSEDED,
            CloseReason::Evicted => codes::EVICTED,
        }
    }
}

/// Failure to hand a frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The peer is not draining its queue fast enough.
    #[error("Outbound queue full")]
    QueueFull,

    /// The connection has been closed.
    #[error("Connection closed")]
    Closed,
}

/// Send-capable handle to one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    created_at: u64,
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl ConnectionHandle {
    /// Create a handle for `user` with an outbound queue of `capacity` frames.
    #[must_use]
    pub fn new(user: UserId, capacity: usize) -> (Arc<Self>, ConnectionOutbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let handle = Arc::new(Self {
            id: ConnectionId::generate(),
            user,
            created_at,
            tx,
            closed: AtomicBool::new(false),
            close_tx,
        });

        (handle, ConnectionOutbound { rx, close_rx })
    }

    /// Connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Owning user.
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Creation time in Unix milliseconds.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the queue is full or the connection is closed.
    pub fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }

        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Close the connection, signalling its task.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.close_tx.send_replace(Some(reason));
        debug!(connection = %self.id, user = %self.user, ?reason, "Connection closed");
        true
    }

    /// Mark the connection closed without signalling (its own task is ending).
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Work item for a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// A frame to write to the transport.
    Frame(Frame),
    /// The connection was closed from elsewhere.
    Close(CloseReason),
}

async fn wait_closed(close_rx: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    loop {
        if let Some(reason) = *close_rx.borrow_and_update() {
            return reason;
        }
        if close_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Receiving side of a connection, owned by the connection task.
#[derive(Debug)]
pub struct ConnectionOutbound {
    rx: mpsc::Receiver<Frame>,
    close_rx: watch::Receiver<Option<CloseReason>>,
}

impl ConnectionOutbound {
    /// Next queued frame, in enqueue order.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next queued frame, if one is ready.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Drain every frame queued so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Resolves once the handle is closed from elsewhere.
    pub async fn closed(&mut self) -> CloseReason {
        wait_closed(&mut self.close_rx).await
    }

    /// Next thing the connection task must act on.
    ///
    /// A close signal wins over frames still queued.
    pub async fn next(&mut self) -> Outgoing {
        tokio::select! {
            biased;
            reason = wait_closed(&mut self.close_rx) => Outgoing::Close(reason),
            Some(frame) = self.rx.recv() => Outgoing::Frame(frame),
        }
    }

    /// The close reason, if the handle has been closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn_"));
    }

    #[test]
    fn test_send_is_fifo() {
        let (handle, mut outbound) = ConnectionHandle::new(UserId::new("alice"), 8);

        handle.send(Frame::user_online("bob")).unwrap();
        handle.send(Frame::user_offline("bob")).unwrap();

        assert_eq!(
            outbound.drain(),
            vec![Frame::user_online("bob"), Frame::user_offline("bob")]
        );
    }

    #[test]
    fn test_full_queue_is_a_delivery_error() {
        let (handle, _outbound) = ConnectionHandle::new(UserId::new("alice"), 1);

        handle.send(Frame::ping()).unwrap();
        assert_eq!(handle.send(Frame::ping()), Err(DeliveryError::QueueFull));
    }

    #[test]
    fn test_dropped_receiver_is_a_delivery_error() {
        let (handle, outbound) = ConnectionHandle::new(UserId::new("alice"), 4);
        drop(outbound);

        assert_eq!(handle.send(Frame::ping()), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_close_exactly_once() {
        let (handle, mut outbound) = ConnectionHandle::new(UserId::new("alice"), 4);

        assert!(handle.close(CloseReason::Superseded));
        assert!(!handle.close(CloseReason::Evicted));

        assert_eq!(outbound.closed().await, CloseReason::Superseded);
        assert_eq!(outbound.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(handle.send(Frame::ping()), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_next_prefers_close_over_queued_frames() {
        let (handle, mut outbound) = ConnectionHandle::new(UserId::new("alice"), 4);

        handle.send(Frame::ping()).unwrap();
        assert_eq!(outbound.next().await, Outgoing::Frame(Frame::ping()));

        handle.send(Frame::ping()).unwrap();
        handle.close(CloseReason::Evicted);
        assert_eq!(outbound.next().await, Outgoing::Close(CloseReason::Evicted));
    }
}
