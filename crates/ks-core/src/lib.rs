//! ks-core: Shared protocol library for KeySocket.
//!
//! Provides the browser-facing JSON message types, codec helpers, and the
//! error taxonomy shared by the relay server and its tests.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_message};
pub use error::{KsError, KsResult};
pub use messages::{ClientMessage, ServerMessage, StatusState, DEFAULT_SSH_PORT};
