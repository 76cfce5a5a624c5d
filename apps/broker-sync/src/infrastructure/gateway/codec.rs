//! Gateway Codec
//!
//! JSON encode/decode for the gateway wire protocol. The gateway sends
//! one JSON object per WebSocket text frame.

use super::messages::{ClientMessage, GatewayMessage};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame was not a JSON object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for the gateway stream.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame into a [`GatewayMessage`].
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not a JSON object or fails to
    /// parse as a known message shape.
    pub fn decode(&self, text: &str) -> Result<GatewayMessage, CodecError> {
        let trimmed = text.trim();
        if !trimmed.starts_with('{') {
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                &trimmed[..trimmed.len().min(50)]
            )));
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Encode an outbound [`ClientMessage`] to a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, message: &ClientMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }
}
