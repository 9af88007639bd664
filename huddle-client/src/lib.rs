//! Client for the Huddle presence relay.
//!
//! [`RelayClient`] connects over WebSocket, binds an identity with its
//! contact list, and keeps a live view of which contacts are online. It
//! remembers the channels it joined so that [`RelayClient::reconnect`] can
//! restore them, since the relay forgets membership when a connection drops.

mod client;

pub use client::RelayClient;
pub use huddle_proto::codec::WireFormat;

use huddle_proto::codec::CodecError;

/// Errors that can occur when talking to the relay.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting or completing setup took too long.
    #[error("timed out waiting for the relay")]
    Timeout,

    /// The relay could not be reached or the WebSocket failed.
    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),

    /// The relay refused the setup.
    #[error("relay rejected setup: {reason}")]
    Rejected {
        /// Reason reported by the relay.
        reason: String,
    },

    /// An event could not be encoded or a frame could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The connection to the relay is closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
