//! Protocol message definitions for Parley.
//!
//! A message is the logical unit carried inside a frame: a command string
//! plus a string-keyed parameter map. Messages are serialized as JSON so the
//! payload stays self-describing and round-trips any UTF-8 parameter value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Command strings used on the wire.
pub mod commands {
    /// Keepalive probe, answered with [`PONG`].
    pub const PING: &str = "ping";
    /// Keepalive reply.
    pub const PONG: &str = "pong";
    /// Server -> client: RSA public key distribution (`key` parameter, base64 DER).
    pub const SEND_RSA: &str = "sendrsa";
    /// Client -> server: RSA-wrapped AES session key (`key` parameter, base64).
    pub const SEND_AES: &str = "sendaes";
    /// Client -> server: credential check (`user`, `password`).
    pub const AUTHENTICATE: &str = "authenticate";
    /// Server -> client: outcome of an authenticate (`result`: success|failure).
    pub const AUTHENTICATION_RESULT: &str = "authenticationresult";
    /// Client -> server: account creation (`user`, `password`).
    pub const CREATE_ACCOUNT: &str = "createaccount";
    /// Client -> server: chat relay request (`target`, `content`).
    pub const SEND_CHAT_MESSAGE: &str = "sendchatmessage";
    /// Server -> client: relayed chat (`originatinguser`, `content`).
    pub const RECEIVE_CHAT_MESSAGE: &str = "receivechatmessage";
    /// Client -> server: presence query (`name`).
    pub const GET_USER_INFO: &str = "getuserinfo";
    /// Server -> client: presence answer (`online`, `exists`).
    pub const SEND_USER_INFO: &str = "senduserinfo";
}

/// The logical command + parameters unit carried inside a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Command string selecting the handler on the receiving side.
    pub command: String,
    /// String-keyed parameter map.
    #[serde(default)]
    pub content: HashMap<String, String>,
}

impl Message {
    /// Create a message with no parameters.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            content: HashMap::new(),
        }
    }

    /// Attach a parameter, builder style.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter value.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.content.get(key).map(String::as_str)
    }

    /// Serialize to the wire payload form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from a decrypted payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_params() {
        let msg = Message::new(commands::AUTHENTICATE)
            .with_param("user", "alice")
            .with_param("password", "hunter2");
        assert_eq!(msg.command, "authenticate");
        assert_eq!(msg.param("user"), Some("alice"));
        assert_eq!(msg.param("password"), Some("hunter2"));
        assert_eq!(msg.param("missing"), None);
    }

    #[test]
    fn test_round_trip_preserves_content() {
        let msg = Message::new(commands::SEND_CHAT_MESSAGE)
            .with_param("target", "bob")
            .with_param("content", "hej då — ∆ utf8 ✓");
        let bytes = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_missing_content_defaults_to_empty() {
        let back = Message::from_bytes(br#"{"command":"ping"}"#).unwrap();
        assert_eq!(back.command, "ping");
        assert!(back.content.is_empty());
    }

    #[test]
    fn test_garbage_payload_is_deserialization_error() {
        let err = Message::from_bytes(b"\xff\xfe not json").unwrap_err();
        assert!(matches!(
            err,
            crate::error::ProtocolError::Deserialization(_)
        ));
    }
}
