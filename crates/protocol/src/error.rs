//! Error types for the protocol crate.

use thiserror::Error;

use crate::framing::EncryptionMode;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message payload.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (bad padding, corrupt ciphertext, wrong key).
    #[error("decryption failed: {0}")]
    DecryptionFailure(String),

    /// An encrypted frame arrived before the key for its mode was bound.
    #[error("no key bound for {mode} frame")]
    MissingKey {
        /// The encryption mode the frame was tagged with.
        mode: EncryptionMode,
    },

    /// Key material has the wrong length or cannot be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// RSA key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    // Frame errors
    /// Frame header carried an unknown encryption mode byte.
    #[error("unknown encryption mode byte: {0:#04x}")]
    InvalidMode(u8),

    /// Encrypted payload exceeds the 16-bit length field.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual payload size after encryption.
        size: usize,
        /// Maximum encodable payload size.
        max: usize,
    },

    /// A partial frame stalled on the wire past the grace period.
    #[error("timed out mid-frame waiting for remaining bytes")]
    ProtocolTimeout,

    // Connection errors
    /// The peer closed the connection.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Other transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::ProtocolTimeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("decryption") {
            ProtocolError::DecryptionFailure(msg)
        } else {
            ProtocolError::Encryption(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_display_names_mode() {
        let err = ProtocolError::MissingKey {
            mode: EncryptionMode::Aes,
        };
        assert_eq!(err.to_string(), "no key bound for aes frame");
    }

    #[test]
    fn test_message_too_large_display() {
        let err = ProtocolError::MessageTooLarge {
            size: 70_000,
            max: 65_535,
        };
        assert_eq!(
            err.to_string(),
            "message too large: 70000 bytes exceeds maximum of 65535 bytes"
        );
    }

    #[test]
    fn test_invalid_mode_display() {
        let err = ProtocolError::InvalidMode(0x07);
        assert_eq!(err.to_string(), "unknown encryption mode byte: 0x07");
    }

    #[test]
    fn test_io_eof_maps_to_connection_closed() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early eof");
        let err = ProtocolError::from(io);
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_io_timeout_maps_to_protocol_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled");
        let err = ProtocolError::from(io);
        assert!(matches!(err, ProtocolError::ProtocolTimeout));
    }
}
