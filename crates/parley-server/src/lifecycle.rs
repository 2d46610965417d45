//! Lifecycle controller: the single task that owns connect/disconnect
//! bookkeeping and server shutdown.
//!
//! Connection tasks report in through an unbounded channel so they never
//! block on bookkeeping. On shutdown every live connection is told to send
//! `exit` and close; the controller waits a bounded grace period for them to
//! report back, forces the rest closed, and clears the registry.

use crate::session::{ConnId, ConnectionHandle, SessionRegistry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events sent by connection tasks.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// A WebSocket finished its upgrade and is ready for traffic.
    Connected(ConnectionHandle),
    /// The connection task has ended and its socket is closed.
    Disconnected(ConnId),
}

pub type LifecycleSender = mpsc::UnboundedSender<LifecycleEvent>;

/// Summary of a completed shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that were sent `exit`.
    pub notified: usize,
    /// Connections that did not report back within the grace period.
    pub forced: usize,
}

pub struct LifecycleController {
    registry: Arc<SessionRegistry>,
    events: mpsc::UnboundedReceiver<LifecycleEvent>,
    live: HashMap<ConnId, ConnectionHandle>,
    grace: Duration,
}

impl LifecycleController {
    /// Create a controller and the sender connection tasks report through.
    pub fn new(registry: Arc<SessionRegistry>, grace: Duration) -> (Self, LifecycleSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            registry,
            events: rx,
            live: HashMap::new(),
            grace,
        };
        (controller, tx)
    }

    /// Run until `shutdown` resolves, then tear everything down.
    pub async fn run<F>(mut self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        debug!("all lifecycle senders dropped");
                        break;
                    }
                },
            }
        }
        self.shutdown().await
    }

    async fn on_event(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connected(handle) => {
                info!(conn_id = %handle.id(), remote = %handle.remote(), "client connected");
                self.live.insert(handle.id(), handle);
            }
            LifecycleEvent::Disconnected(id) => {
                let username = self.registry.unregister(id).await;
                if let Some(handle) = self.live.remove(&id) {
                    handle.close();
                }
                info!(
                    conn_id = %id,
                    username = username.as_deref().unwrap_or("-"),
                    "client disconnected"
                );
            }
        }
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        // Settle whatever was reported before the signal won the race.
        while let Ok(event) = self.events.try_recv() {
            self.on_event(event).await;
        }

        let registered = self.registry.drain().await;
        for handle in registered {
            self.live.entry(handle.id()).or_insert(handle);
        }

        let mut report = ShutdownReport {
            notified: self.live.len(),
            forced: 0,
        };
        info!(connections = report.notified, "broadcasting exit to connected clients");
        for handle in self.live.values() {
            handle.terminate();
        }

        let deadline = tokio::time::sleep(self.grace);
        tokio::pin!(deadline);
        while !self.live.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                event = self.events.recv() => match event {
                    Some(LifecycleEvent::Disconnected(id)) => {
                        self.live.remove(&id);
                    }
                    Some(LifecycleEvent::Connected(handle)) => {
                        // Raced with shutdown; turn it away too.
                        handle.terminate();
                        report.notified += 1;
                        self.live.insert(handle.id(), handle);
                    }
                    None => break,
                },
            }
        }

        if !self.live.is_empty() {
            report.forced = self.live.len();
            warn!(remaining = report.forced, "grace period elapsed, forcing connections closed");
            for handle in self.live.values() {
                handle.close();
            }
            self.live.clear();
        }
        // Anything that registered while we were waiting.
        self.registry.drain().await;

        info!(notified = report.notified, forced = report.forced, "shutdown complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use std::net::SocketAddr;
    use tokio::sync::oneshot;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn disconnect_unregisters_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (controller, events) = LifecycleController::new(registry.clone(), Duration::from_secs(1));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));

        let (handle, _rx, _close) = ConnectionHandle::new(addr(), 4);
        events.send(LifecycleEvent::Connected(handle.clone())).unwrap();
        registry.register(handle.clone(), "alice".into()).await;
        events.send(LifecycleEvent::Disconnected(handle.id())).unwrap();

        // Let the controller drain its queue.
        for _ in 0..50 {
            if registry.lookup("alice").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.lookup("alice").await.is_none());

        stop_tx.send(()).unwrap();
        let report = task.await.unwrap();
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn shutdown_broadcasts_exit_and_clears_registry() {
        let registry = Arc::new(SessionRegistry::new());
        let (controller, events) = LifecycleController::new(registry.clone(), Duration::from_secs(2));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));

        // One authenticated and one anonymous connection, each simulated by a
        // task that reports back once it sees Terminate.
        let mut seen = Vec::new();
        for name in [Some("alice"), None] {
            let (handle, mut rx, _close) = ConnectionHandle::new(addr(), 4);
            events.send(LifecycleEvent::Connected(handle.clone())).unwrap();
            if let Some(name) = name {
                registry.register(handle.clone(), name.into()).await;
            }
            let events = events.clone();
            seen.push(tokio::spawn(async move {
                let got_terminate = matches!(rx.recv().await, Some(Outbound::Terminate));
                let _ = events.send(LifecycleEvent::Disconnected(handle.id()));
                got_terminate
            }));
        }

        stop_tx.send(()).unwrap();
        let report = task.await.unwrap();
        assert_eq!(report.notified, 2);
        assert_eq!(report.forced, 0);
        for s in seen {
            assert!(s.await.unwrap());
        }
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn unresponsive_connections_are_forced_after_grace() {
        let registry = Arc::new(SessionRegistry::new());
        let (controller, events) =
            LifecycleController::new(registry.clone(), Duration::from_millis(50));
        let (handle, _rx, close) = ConnectionHandle::new(addr(), 4);
        events.send(LifecycleEvent::Connected(handle)).unwrap();

        let report = controller.run(async {}).await;
        assert_eq!(report.notified, 1);
        assert_eq!(report.forced, 1);
        tokio::time::timeout(Duration::from_secs(1), close.notified())
            .await
            .expect("forced close was not signalled");
    }
}
