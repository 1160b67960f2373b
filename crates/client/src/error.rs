//! Client-side error type.

use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server never answered a correlated request in time.
    #[error("timed out waiting for a reply to '{command}'")]
    RequestTimeout { command: String },

    /// The RSA-to-AES key exchange did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The operation needs a successful authenticate first.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The connection's read loop has stopped.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
