//! # Parley Protocol Library
//!
//! Wire format and cryptographic primitives shared by the Parley server and
//! client.
//!
//! ## Overview
//!
//! This crate is the foundation of Parley's session layer, providing:
//!
//! - **Message model**: command + string-keyed parameter map, JSON payloads
//! - **Frame codec**: mode-tagged, length-prefixed frames with a bounded
//!   mid-frame stall timeout
//! - **Encryption modes**: plaintext, AES-256-CBC transport, and the RSA
//!   block used to hand the session key to the server
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Application Messages             │  JSON command + params
//! ├─────────────────────────────────────────┤
//! │   Payload Encryption (none/AES/RSA)     │
//! ├─────────────────────────────────────────┤
//! │  Framing: [mode u8][len u16 BE][bytes]  │
//! ├─────────────────────────────────────────┤
//! │            Transport (TCP)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use protocol::{commands, encode_frame, FrameCipher, Message};
//!
//! let msg = Message::new(commands::GET_USER_INFO).with_param("name", "alice");
//! let frame = encode_frame(&msg, FrameCipher::Plain).unwrap();
//! assert_eq!(frame[0], 0); // plaintext mode byte
//! ```

pub mod crypto;
pub mod error;
pub mod framing;
pub mod message;

pub use crypto::{AesKey, RsaKeyPair, AES_IV_SIZE, AES_KEY_SIZE, RSA_KEY_BITS};
pub use error::{ProtocolError, Result};
pub use framing::{
    encode_frame, read_frame, DecryptKeys, EncryptionMode, FrameCipher, FRAME_HEADER_SIZE,
    FRAME_STALL_TIMEOUT, MAX_PAYLOAD_SIZE,
};
pub use message::{commands, Message};
