//! WebSocket transport using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the WebSocket upgrade on the configured
//! path, and hands finished connections to the server through a channel.

use futures_util::{SinkExt, StreamExt};
use parley_core::{ParleyError, ParleyResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An accepted, upgraded WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start accepting on an already-bound listener.
///
/// Returns a receiver that yields upgraded connections. The accept task ends
/// when the receiver is dropped.
pub fn start_listener(
    listener: TcpListener,
    path: String,
    max_frame_size: usize,
) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, path = %path, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = tx.closed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, &path, max_frame_size).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket accept loop stopped");
    });

    rx
}

/// Upgrade a TCP stream, rejecting requests for any other path with 404.
async fn upgrade(
    stream: TcpStream,
    path: &str,
    max_frame_size: usize,
) -> ParleyResult<WebSocketStream<TcpStream>> {
    let expected = path.to_string();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut reject = ErrorResponse::new(Some("not found".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        }
    };
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_size);
    config.max_frame_size = Some(max_frame_size);

    tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(config))
        .await
        .map_err(|e| ParleyError::Transport(format!("WS upgrade failed: {e}")))
}

/// Send one text frame.
pub async fn ws_send_text(ws: &mut WebSocketStream<TcpStream>, text: String) -> ParleyResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ParleyError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next data frame as bytes.
///
/// Returns `None` once the peer has closed. Text and binary frames are both
/// accepted; pings are answered in place.
pub async fn ws_recv(ws: &mut WebSocketStream<TcpStream>) -> ParleyResult<Option<Vec<u8>>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
            Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ParleyError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

/// Close the socket politely; errors are irrelevant at this point.
pub async fn ws_close(ws: &mut WebSocketStream<TcpStream>) {
    let _ = ws.close(None).await;
}
