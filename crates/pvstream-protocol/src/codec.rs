//! WebSocket message codec for the PV stream.
//!
//! Messages are JSON objects carried in WebSocket text frames.

use crate::messages::{ClientMessage, PvUpdateMessage, ServerMessage};
use pvstream_core::PvUpdate;
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Failed to process message: {0}")]
    Json(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,
}

/// Encode a server message to JSON string for WebSocket transmission.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Encode one dispatcher update as a `pv_update` frame.
pub fn encode_update(update: &PvUpdate) -> Result<String, CodecError> {
    encode_server_message(&ServerMessage::PvUpdate(PvUpdateMessage::from(update)))
}

/// Decode a client message from JSON string received over WebSocket.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}
