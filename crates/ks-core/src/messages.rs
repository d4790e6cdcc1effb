//! Browser-facing message types.
//!
//! Messages travel as JSON over WebSocket text frames, internally tagged
//! with a `type` field so the browser side can dispatch on it directly.

use serde::{Deserialize, Serialize};

/// Default SSH port used when a connect request omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Messages received from a browser peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request to open a remote shell.
    Connect {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
        username: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        private_key: Option<String>,
    },
    /// Keystrokes destined for the shell channel.
    Input { text: String },
    /// Terminal window size change.
    Resize { rows: u16, cols: u16 },
    /// Explicit request to tear the session down.
    Disconnect,
}

/// Connection state reported in a [`ServerMessage::Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Connected,
    Disconnected,
}

/// Messages sent to a browser peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection lifecycle notice.
    Status { state: StatusState, message: String },
    /// Terminal failure notice.
    Error { message: String },
    /// Shell output to render in the terminal widget.
    Output { text: String },
}

impl ServerMessage {
    pub fn connected(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            state: StatusState::Connected,
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        ServerMessage::Status {
            state: StatusState::Disconnected,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn output(text: impl Into<String>) -> Self {
        ServerMessage::Output { text: text.into() }
    }
}
