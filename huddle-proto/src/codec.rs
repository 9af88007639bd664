//! Serialization for the Huddle wire protocol.
//!
//! Native clients send postcard-encoded binary frames; browser clients send
//! JSON text frames. A connection's replies use the format of its first
//! frame, tracked as a [`WireFormat`].

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Postcard serialization or deserialization failed.
    #[error("binary codec error: {0}")]
    Binary(#[from] postcard::Error),
    /// JSON serialization or deserialization failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// Postcard in WebSocket binary frames.
    Binary,
    /// JSON in WebSocket text frames.
    Text,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Text => write!(f, "text"),
        }
    }
}

/// An encoded frame ready to be put on a WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Postcard bytes.
    Binary(Vec<u8>),
    /// JSON document.
    Text(String),
}

impl Frame {
    /// The format this frame is encoded in.
    #[must_use]
    pub const fn format(&self) -> WireFormat {
        match self {
            Self::Binary(_) => WireFormat::Binary,
            Self::Text(_) => WireFormat::Text,
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(b) => b.len(),
            Self::Text(t) => t.len(),
        }
    }

    /// Whether the frame carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WireFormat {
    /// Encodes `value` in this format.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if serialization fails.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Frame, CodecError> {
        match self {
            Self::Binary => encode_binary(value).map(Frame::Binary),
            Self::Text => encode_text(value).map(Frame::Text),
        }
    }
}

/// Decodes a value from a frame of either format.
///
/// # Errors
///
/// Returns [`CodecError`] if the frame does not hold a valid `T`.
pub fn decode<T: DeserializeOwned>(frame: &Frame) -> Result<T, CodecError> {
    match frame {
        Frame::Binary(bytes) => decode_binary(bytes),
        Frame::Text(text) => decode_text(text),
    }
}

/// Encodes a value as postcard bytes.
///
/// # Errors
///
/// Returns [`CodecError::Binary`] if the value cannot be serialized.
pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Decodes a value from postcard bytes.
///
/// # Errors
///
/// Returns [`CodecError::Binary`] if the bytes cannot be deserialized.
pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Encodes a value as a JSON document.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the value cannot be serialized.
pub fn encode_text<T: Serialize>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

/// Decodes a value from a JSON document.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if the text is not a valid `T`.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(text)?)
}
