//! Core server: accepts WebSocket connections and runs one task per
//! connection.
//!
//! Each connection task reads envelopes in order, dispatches them on its own
//! task, and writes replies and pushes to its socket. The lifecycle
//! controller runs alongside the accept loop and ends the server on shutdown.

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::lifecycle::{LifecycleController, LifecycleEvent, LifecycleSender, ShutdownReport};
use crate::session::{ConnectionHandle, Outbound};
use crate::state::RelayState;
use crate::store::SharedStore;
use crate::transport::websocket::{self, WebSocketConnection};
use parley_core::{decode, encode, Envelope, ParleyError, ParleyResult};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// The parley relay server.
pub struct ChatServer {
    config: Arc<ServerConfig>,
    relay: RelayState,
}

impl ChatServer {
    /// Create a server over an already-open store.
    pub fn new(config: ServerConfig, store: SharedStore) -> Self {
        let relay = RelayState::new(store, config.push_timeout);
        Self {
            config: Arc::new(config),
            relay,
        }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> ParleyResult<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ParleyError::Transport(format!("bind {addr} failed: {e}")))
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// Returns once every connection has been sent `exit` and closed (or the
    /// grace period ran out) and the registry is empty.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let mut ws_rx = websocket::start_listener(
            listener,
            self.config.ws_path.clone(),
            self.config.max_frame_size,
        );

        let (controller, events) =
            LifecycleController::new(self.relay.registry.clone(), self.config.shutdown_grace);
        let controller = controller.run(shutdown);
        tokio::pin!(controller);

        info!(path = %self.config.ws_path, "parley-server ready");

        let report = loop {
            tokio::select! {
                report = &mut controller => break report,
                Some(conn) = ws_rx.recv() => {
                    let relay = self.relay.clone();
                    let config = self.config.clone();
                    let events = events.clone();
                    tokio::spawn(async move {
                        handle_connection(relay, config, conn, events).await;
                    });
                }
            }
        };

        // Upgraded but never picked up: turn them away before stopping the
        // accept loop.
        ws_rx.close();
        while let Ok(mut conn) = ws_rx.try_recv() {
            turn_away(&mut conn).await;
        }
        report
    }
}

/// Run one connection from upgrade to close.
async fn handle_connection(
    relay: RelayState,
    config: Arc<ServerConfig>,
    mut conn: WebSocketConnection,
    events: LifecycleSender,
) {
    let (handle, mut outbound, close) =
        ConnectionHandle::new(conn.remote_addr, config.outbound_queue);
    let id = handle.id();

    if events.send(LifecycleEvent::Connected(handle.clone())).is_err() {
        // Controller is gone: the server is shutting down.
        turn_away(&mut conn).await;
        return;
    }

    let mut dispatcher = Dispatcher::new(handle, relay);
    match session_loop(&mut conn, &mut dispatcher, &mut outbound, &close).await {
        Ok(()) => debug!(conn_id = %id, "session ended"),
        Err(e) => warn!(conn_id = %id, remote = %conn.remote_addr, error = %e, "closing connection"),
    }

    websocket::ws_close(&mut conn.ws_stream).await;
    let _ = events.send(LifecycleEvent::Disconnected(id));
}

/// Send `exit` and close a connection that arrived during shutdown.
async fn turn_away(conn: &mut WebSocketConnection) {
    debug!(remote = %conn.remote_addr, "server shutting down, sending exit");
    if let Ok(text) = encode(&Envelope::exit()) {
        let _ = websocket::ws_send_text(&mut conn.ws_stream, text).await;
    }
    websocket::ws_close(&mut conn.ws_stream).await;
}

/// Read, dispatch, reply; interleaved with pushes from other connections.
async fn session_loop(
    conn: &mut WebSocketConnection,
    dispatcher: &mut Dispatcher,
    outbound: &mut mpsc::Receiver<Outbound>,
    close: &Notify,
) -> ParleyResult<()> {
    loop {
        tokio::select! {
            _ = close.notified() => {
                debug!("close requested");
                return Ok(());
            }

            Some(item) = outbound.recv() => match item {
                Outbound::Send(envelope) => {
                    websocket::ws_send_text(&mut conn.ws_stream, encode(&envelope)?).await?;
                }
                Outbound::Terminate => {
                    websocket::ws_send_text(&mut conn.ws_stream, encode(&Envelope::exit())?).await?;
                    return Ok(());
                }
            },

            frame = websocket::ws_recv(&mut conn.ws_stream) => match frame? {
                Some(data) => {
                    let envelope = decode(&data)?;
                    if let Some(reply) = dispatcher.dispatch(envelope).await? {
                        websocket::ws_send_text(&mut conn.ws_stream, encode(&reply)?).await?;
                    }
                }
                None => {
                    debug!("peer closed");
                    return Ok(());
                }
            },
        }
    }
}
