//! JSON codec for the browser protocol.
//!
//! One message per WebSocket text frame. Decode failures are reported as
//! [`KsError::Codec`] so the transport layer can log and skip bad frames
//! without dropping the connection.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{KsError, KsResult};

/// Serialize a message to a JSON string.
pub fn encode_message<T: Serialize>(msg: &T) -> KsResult<String> {
    serde_json::to_string(msg).map_err(|e| KsError::Codec(e.to_string()))
}

/// Deserialize a message from a JSON string.
pub fn decode_message<T: DeserializeOwned>(raw: &str) -> KsResult<T> {
    serde_json::from_str(raw).map_err(|e| KsError::Codec(e.to_string()))
}
