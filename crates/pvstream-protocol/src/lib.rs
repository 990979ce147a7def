//! # pvstream-protocol
//!
//! Message types and codec for the PV streaming protocol and the history
//! query API.
//!
//! The stream carries one JSON object per WebSocket text frame, discriminated
//! by its `"type"` field.

pub mod codec;
pub mod messages;

pub use codec::{decode_client_message, encode_server_message, encode_update, CodecError};
pub use messages::*;
