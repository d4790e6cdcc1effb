//! WebSocket transport using tokio-tungstenite.
//!
//! Messages are JSON, one per text frame. The listener hands accepted
//! connections to the server through a channel; each connection is wrapped
//! in a [`WsTransport`] implementing the relay's transport trait.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use ks_core::{codec, ClientMessage, KsError, KsResult, ServerMessage};

use super::ClientTransport;

/// Maximum inbound frame size (100 KiB). Larger frames are dropped whole.
const MAX_WS_FRAME_SIZE: usize = 100 * 1024;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> KsResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| KsError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
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
    });

    Ok(rx)
}

/// [`ClientTransport`] over an accepted WebSocket stream.
pub struct WsTransport {
    ws: WebSocketStream<TcpStream>,
}

impl WsTransport {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        Self { ws }
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send(&mut self, msg: &ServerMessage) -> KsResult<()> {
        let json = codec::encode_message(msg)?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| KsError::Transport(format!("WS send failed: {e}")))
    }

    async fn recv(&mut self) -> KsResult<Option<ClientMessage>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(txt))) => {
                    if txt.len() > MAX_WS_FRAME_SIZE {
                        warn!(len = txt.len(), "dropping oversized frame");
                        continue;
                    }
                    match codec::decode_message::<ClientMessage>(txt.as_str()) {
                        Ok(msg) => return Ok(Some(msg)),
                        Err(e) => {
                            warn!(error = %e, "dropping malformed frame");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Ping(payload))) => {
                    // Respond to pings automatically.
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {
                    // Ignore binary and other frame types.
                    continue;
                }
                Some(Err(e)) => {
                    return Err(KsError::Transport(format!("WS recv failed: {e}")));
                }
            }
        }
    }

    async fn close(&mut self) -> KsResult<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| KsError::Transport(format!("WS close failed: {e}")))
    }
}
