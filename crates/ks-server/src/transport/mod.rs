//! Browser transport seam.
//!
//! The relay loop is written against [`ClientTransport`] so tests can
//! substitute in-memory channels; production uses the WebSocket adapter.

pub mod websocket;

use async_trait::async_trait;

use ks_core::{ClientMessage, KsResult, ServerMessage};

/// One connected browser peer.
#[async_trait]
pub trait ClientTransport: Send {
    /// Push a message to the peer.
    async fn send(&mut self, msg: &ServerMessage) -> KsResult<()>;

    /// Next message from the peer. `Ok(None)` means the peer is gone;
    /// malformed frames are skipped, not surfaced.
    async fn recv(&mut self) -> KsResult<Option<ClientMessage>>;

    /// Close the connection. Best effort.
    async fn close(&mut self) -> KsResult<()>;
}
