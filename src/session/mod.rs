//! Session handles and per-connection capabilities
//!
//! The exchange never owns a connection. It talks to sessions through the
//! [`SessionHandle`] trait, keyed by a [`SessionId`] that the connection
//! layer allocates. [`ChannelSession`] is the stock handle: deliveries go
//! into a bounded tokio channel drained by the connection's writer task.

pub mod capabilities;

pub use capabilities::{AliasAssignment, SessionCapabilities};

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::Publish;

/// Identifies one live connection in the exchange's registry
pub type SessionId = u64;

/// A live session as seen by the exchange.
///
/// `deliver` is called from `Exchange::publish` and must not block.
pub trait SessionHandle: Send + Sync + 'static {
    /// Queue a publish for the client. False means it was not accepted.
    fn deliver(&self, publish: Publish) -> bool;

    fn is_connected(&self) -> bool;

    /// Last time the client was heard from
    fn last_activity(&self) -> Instant;

    /// Tear the session down; later deliveries are refused
    fn close(&self);
}

/// Session handle backed by a bounded `mpsc` channel
#[derive(Debug)]
pub struct ChannelSession {
    id: SessionId,
    tx: mpsc::Sender<Publish>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl ChannelSession {
    /// Create a handle and the receiver its writer task drains
    pub fn new(id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Publish>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Self {
            id,
            tx,
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Record client activity (any inbound packet)
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

impl SessionHandle for ChannelSession {
    fn deliver(&self, publish: Publish) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(publish) {
            Ok(()) => {
                trace!(session_id = self.id, "queued publish");
                true
            }
            Err(TrySendError::Full(p)) => {
                debug!(
                    session_id = self.id,
                    topic = %p.topic,
                    "session queue full, dropping publish"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(session_id = self.id, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[tokio::test]
    async fn channel_session_delivers_until_closed() {
        let (session, mut rx) = ChannelSession::new(1, 4);
        assert!(session.is_connected());
        assert!(session.deliver(Publish::new("a", &b"1"[..], QoS::AtMostOnce)));
        assert_eq!(&*rx.recv().await.unwrap().topic, "a");

        session.close();
        session.close();
        assert!(!session.is_connected());
        assert!(!session.deliver(Publish::new("a", &b"2"[..], QoS::AtMostOnce)));
    }

    #[tokio::test]
    async fn dropped_receiver_disconnects() {
        let (session, rx) = ChannelSession::new(2, 1);
        drop(rx);
        assert!(!session.is_connected());
        assert!(!session.deliver(Publish::new("a", &b""[..], QoS::AtMostOnce)));
    }

    #[tokio::test]
    async fn full_queue_refuses() {
        let (session, _rx) = ChannelSession::new(3, 1);
        assert!(session.deliver(Publish::new("a", &b""[..], QoS::AtMostOnce)));
        assert!(!session.deliver(Publish::new("b", &b""[..], QoS::AtMostOnce)));
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_moves_last_activity() {
        let (session, _rx) = ChannelSession::new(4, 1);
        let before = session.last_activity();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        session.touch();
        assert_eq!(session.last_activity() - before, std::time::Duration::from_secs(5));
    }
}
