//! Transport handle for one connected rider.
//!
//! The relay never writes to a socket directly. Each connection owns a
//! bounded outbound queue drained by its own writer task, and a
//! cancellation token that tears the connection down. Room state stores
//! clones of this handle, so delivery under a room lock never awaits.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::protocol::Outgoing;

/// Cloneable sending half of a connection.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    outbound: mpsc::Sender<Arc<str>>,
    shutdown: CancellationToken,
}

impl PeerHandle {
    /// Create a handle plus the receiving end its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            outbound,
            shutdown: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Queue a pre-encoded frame. Returns false if the peer is closed or
    /// its queue is full.
    pub fn send_frame(&self, frame: Arc<str>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Encode and queue a single envelope.
    pub fn send(&self, msg: &Outgoing) -> bool {
        match msg.to_frame() {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                log::error!("Failed to encode outgoing envelope: {e}");
                false
            }
        }
    }

    /// Force the connection closed. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }

    /// Token the connection task watches for forced closure.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridepulse_core::RoomId;

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let (peer, mut rx) = PeerHandle::channel(4);
        let pong = Outgoing::Pong {
            room_id: RoomId::new("R"),
            ts: 7,
        };
        assert!(peer.send(&pong));
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains(r#""type":"pong""#));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (peer, _rx) = PeerHandle::channel(1);
        assert!(peer.send_frame(Arc::from("a")));
        assert!(!peer.send_frame(Arc::from("b")));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_delivery() {
        let (peer, mut rx) = PeerHandle::channel(4);
        let token = peer.shutdown_token();
        peer.close();
        peer.close();
        assert!(token.is_cancelled());
        assert!(peer.is_closed());
        assert!(!peer.send_frame(Arc::from("late")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_reports_closed() {
        let (peer, rx) = PeerHandle::channel(4);
        drop(rx);
        assert!(peer.is_closed());
        assert!(!peer.send_frame(Arc::from("x")));
    }
}
