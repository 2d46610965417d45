//! Handles to live connections.
//!
//! The socket itself is owned by its connection task. Everyone else reaches a
//! connection through a cloneable [`ConnectionHandle`]: a bounded outbound
//! queue plus a close signal.

use parley_core::Envelope;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify};

/// Opaque, process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Items queued for a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    /// Write this envelope.
    Send(Envelope),
    /// Write `exit` and close; used at shutdown.
    Terminate,
}

/// Why a push to a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue stayed full for the whole wait: the peer is not reading.
    Full,
    /// The connection task is gone.
    Closed,
}

/// Cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    remote: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving halves its connection task consumes.
    pub fn new(
        remote: SocketAddr,
        queue: usize,
    ) -> (Self, mpsc::Receiver<Outbound>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let close = Arc::new(Notify::new());
        let handle = Self {
            id: ConnId::next(),
            remote,
            tx,
            close: close.clone(),
        };
        (handle, rx, close)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue an envelope, waiting at most `wait` for room in a full queue.
    pub async fn push(&self, envelope: Envelope, wait: Duration) -> Result<(), PushError> {
        self.tx
            .send_timeout(Outbound::Send(envelope), wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => PushError::Full,
                SendTimeoutError::Closed(_) => PushError::Closed,
            })
    }

    /// Ask the connection to send `exit` after whatever is already queued,
    /// then close. Falls back to an immediate close if the queue is full.
    pub fn terminate(&self) {
        if self.tx.try_send(Outbound::Terminate).is_err() {
            self.close();
        }
    }

    /// Close the connection as soon as its task observes the signal.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ra, _) = ConnectionHandle::new(addr(), 4);
        let (b, _rb, _) = ConnectionHandle::new(addr(), 4);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn push_reports_full_and_closed() {
        let wait = Duration::from_millis(20);
        let (h, rx, _) = ConnectionHandle::new(addr(), 1);
        assert!(h.push(Envelope::ok(), wait).await.is_ok());
        assert_eq!(h.push(Envelope::ok(), wait).await, Err(PushError::Full));
        drop(rx);
        assert_eq!(h.push(Envelope::ok(), wait).await, Err(PushError::Closed));
    }

    #[tokio::test]
    async fn push_waits_for_a_slow_reader() {
        let (h, mut rx, _) = ConnectionHandle::new(addr(), 1);
        h.push(Envelope::ok(), Duration::ZERO).await.unwrap();
        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first.is_some(), second.is_some())
        });
        assert!(h.push(Envelope::ok(), Duration::from_secs(2)).await.is_ok());
        assert_eq!(reader.await.unwrap(), (true, true));
    }

    #[tokio::test]
    async fn close_signal_is_remembered() {
        let (h, _rx, close) = ConnectionHandle::new(addr(), 1);
        h.close();
        // notify_one stores a permit, so a later waiter still wakes.
        tokio::time::timeout(Duration::from_secs(1), close.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminate_is_queued_behind_pushes() {
        let (h, mut rx, _) = ConnectionHandle::new(addr(), 4);
        h.push(Envelope::ok(), Duration::ZERO).await.unwrap();
        h.terminate();
        assert!(matches!(rx.recv().await, Some(Outbound::Send(_))));
        assert!(matches!(rx.recv().await, Some(Outbound::Terminate)));
    }
}
