//! Wire codec: length-prefixed, encryption-tagged frames.
//!
//! # Frame format
//!
//! Each frame consists of:
//! - 1 byte: encryption mode (0 = none, 1 = AES, 2 = RSA)
//! - 2 bytes: payload length (big-endian)
//! - N bytes: payload (possibly encrypted)
//!
//! The length counts only the payload, after encryption. A frame whose
//! declared length cannot be fully read within a 5 second grace period is a
//! protocol timeout rather than a silent truncation.

use std::fmt;
use std::time::Duration;

use rsa::RsaPrivateKey;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::crypto::{self, AesKey};
use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// Maximum payload size encodable in the 16-bit length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame header size: 1 (mode) + 2 (length) = 3 bytes.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Grace period for the remainder of a frame once its header has started.
pub const FRAME_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Encryption mode tag carried in the first frame byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Plaintext payload. Used for handshake bootstrap and keepalives.
    None,
    /// AES-256-CBC payload (`IV || ciphertext`) under the session key.
    Aes,
    /// Single RSA PKCS#1 v1.5 block. Only carries the AES key handoff.
    Rsa,
}

impl EncryptionMode {
    /// Wire byte for this mode.
    pub fn as_byte(self) -> u8 {
        match self {
            EncryptionMode::None => 0,
            EncryptionMode::Aes => 1,
            EncryptionMode::Rsa => 2,
        }
    }

    /// Parse a wire byte, rejecting unknown tags.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(EncryptionMode::None),
            1 => Ok(EncryptionMode::Aes),
            2 => Ok(EncryptionMode::Rsa),
            other => Err(ProtocolError::InvalidMode(other)),
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionMode::None => "plaintext",
            EncryptionMode::Aes => "aes",
            EncryptionMode::Rsa => "rsa",
        };
        f.write_str(name)
    }
}

/// Cipher selection for an outgoing frame.
///
/// Carrying the key with the mode makes a keyless AES/RSA encode
/// unrepresentable.
#[derive(Debug, Clone, Copy)]
pub enum FrameCipher<'a> {
    /// No encryption.
    Plain,
    /// Encrypt under the session AES key.
    Aes(&'a AesKey),
    /// Encrypt to a peer's PKCS#1 DER public key.
    Rsa {
        /// The peer public key, as received in `sendrsa`.
        public_key_der: &'a [u8],
    },
}

impl FrameCipher<'_> {
    /// The mode byte this cipher produces.
    pub fn mode(&self) -> EncryptionMode {
        match self {
            FrameCipher::Plain => EncryptionMode::None,
            FrameCipher::Aes(_) => EncryptionMode::Aes,
            FrameCipher::Rsa { .. } => EncryptionMode::Rsa,
        }
    }
}

/// Key material available for decoding incoming frames.
///
/// Both keys are optional: a frame tagged with a mode whose key is absent
/// fails with [`ProtocolError::MissingKey`] rather than returning garbage.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecryptKeys<'a> {
    /// Session AES key, bound after the handshake completes.
    pub aes: Option<&'a AesKey>,
    /// RSA private key. Only the server holds one.
    pub rsa: Option<&'a RsaPrivateKey>,
}

/// Encode a message into a complete frame.
///
/// The length field is computed from the post-encryption byte count;
/// payloads that no longer fit in 16 bits fail with `MessageTooLarge`.
pub fn encode_frame(message: &Message, cipher: FrameCipher<'_>) -> Result<Vec<u8>> {
    let plain = message.to_bytes()?;
    let payload = match cipher {
        FrameCipher::Plain => plain,
        FrameCipher::Aes(key) => crypto::aes_encrypt(key, &plain),
        FrameCipher::Rsa { public_key_der } => crypto::rsa_encrypt(public_key_der, &plain)?,
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.push(cipher.mode().as_byte());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read and decode one frame from the transport.
///
/// Suspends until the first header byte arrives; once a frame has started,
/// the remainder must land within [`FRAME_STALL_TIMEOUT`] or the read fails
/// with `ProtocolTimeout`. A clean close before any header byte surfaces as
/// `ConnectionClosed`.
pub async fn read_frame<R>(reader: &mut R, keys: DecryptKeys<'_>) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut mode_byte = [0u8; 1];
    if reader.read(&mut mode_byte).await? == 0 {
        return Err(ProtocolError::ConnectionClosed(
            "peer closed between frames".to_string(),
        ));
    }
    let mode = EncryptionMode::from_byte(mode_byte[0])?;

    let mut length_bytes = [0u8; 2];
    read_exact_or_stall(reader, &mut length_bytes).await?;
    let length = u16::from_be_bytes(length_bytes) as usize;

    let mut payload = vec![0u8; length];
    read_exact_or_stall(reader, &mut payload).await?;

    let plain = match mode {
        EncryptionMode::None => payload,
        EncryptionMode::Aes => {
            let key = keys.aes.ok_or(ProtocolError::MissingKey { mode })?;
            crypto::aes_decrypt(key, &payload)?
        }
        EncryptionMode::Rsa => {
            let key = keys.rsa.ok_or(ProtocolError::MissingKey { mode })?;
            crypto::rsa_decrypt(key, &payload)?
        }
    };

    Message::from_bytes(&plain)
}

async fn read_exact_or_stall<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match timeout(FRAME_STALL_TIMEOUT, reader.read_exact(buf)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(ProtocolError::ProtocolTimeout),
    }
}
