//! Per-connection session state.
//!
//! The registry exclusively owns each session. A session's AES key and
//! authenticated username are set once during the connection's life and read
//! thereafter; the liveness clock is shared between the sweeper and the
//! session's message handler.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use protocol::{encode_frame, AesKey, EncryptionMode, FrameCipher, Message, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = Uuid;

/// State for one connected, possibly-authenticated client.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    /// Receive half. The sweeper takes this with `try_lock_owned` so a
    /// session never has more than one active message handler, and probes
    /// readability only when no handler is running.
    reader: Arc<Mutex<OwnedReadHalf>>,
    /// Send half. Physical writes are serialized here; handlers for other
    /// sessions may relay into this session concurrently.
    writer: Mutex<OwnedWriteHalf>,
    aes_key: RwLock<Option<AesKey>>,
    username: RwLock<Option<String>>,
    last_message: StdMutex<Instant>,
    inactivity_warned: AtomicBool,
}

impl Session {
    /// Wrap an accepted connection.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            reader: Arc::new(Mutex::new(read_half)),
            writer: Mutex::new(write_half),
            aes_key: RwLock::new(None),
            username: RwLock::new(None),
            last_message: StdMutex::new(Instant::now()),
            inactivity_warned: AtomicBool::new(false),
        }
    }

    /// Session identifier used for registry routing.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address, for logging.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Handle to the receive half for the sweeper's handler scheduling.
    pub(crate) fn reader(&self) -> Arc<Mutex<OwnedReadHalf>> {
        Arc::clone(&self.reader)
    }

    /// Bind the session AES key delivered by `sendaes`.
    ///
    /// Returns `false` if a key was already bound; the original key stays.
    pub fn bind_aes_key(&self, key: AesKey) -> bool {
        let mut slot = self.aes_key.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(key);
        true
    }

    /// The session AES key, if the handshake has completed.
    pub fn aes_key(&self) -> Option<AesKey> {
        self.aes_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bind the authenticated username after a successful credential check.
    ///
    /// Returns `false` if the session was already authenticated; the first
    /// binding wins (there is no logout or re-identification in scope).
    pub fn bind_username(&self, username: &str) -> bool {
        let mut slot = self.username.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(username.to_string());
        true
    }

    /// The authenticated username, if any.
    pub fn username(&self) -> Option<String> {
        self.username
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a successful authenticate has bound a username.
    pub fn is_authenticated(&self) -> bool {
        self.username
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Record traffic: reset the liveness clock and re-arm the warning.
    pub fn touch(&self) {
        *self
            .last_message
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.inactivity_warned.store(false, Ordering::Relaxed);
    }

    /// Time since the last observed traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_message
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Flag the keepalive warning as sent. Returns the previous state, so
    /// the sweeper sends exactly one ping per idle spell.
    pub fn mark_warned(&self) -> bool {
        self.inactivity_warned.swap(true, Ordering::Relaxed)
    }

    /// Send a message without encryption (handshake bootstrap, keepalives).
    pub async fn send_plain(&self, message: &Message) -> protocol::Result<()> {
        let frame = encode_frame(message, FrameCipher::Plain)?;
        self.write_frame(&frame).await
    }

    /// Send a message under the session AES key.
    ///
    /// Fails with `MissingKey` when the handshake has not completed; the
    /// connection itself stays up.
    pub async fn send_encrypted(&self, message: &Message) -> protocol::Result<()> {
        let key = self.aes_key().ok_or(ProtocolError::MissingKey {
            mode: EncryptionMode::Aes,
        })?;
        let frame = encode_frame(message, FrameCipher::Aes(&key))?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &[u8]) -> protocol::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Best-effort transport shutdown on eviction or error.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{commands, read_frame, DecryptKeys};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (Session::new(server_side, peer), client)
    }

    #[tokio::test]
    async fn test_send_plain_reaches_peer() {
        let (session, mut client) = connected_pair().await;
        session
            .send_plain(&Message::new(commands::PING))
            .await
            .unwrap();

        let received = read_frame(&mut client, DecryptKeys::default()).await.unwrap();
        assert_eq!(received.command, "ping");
    }

    #[tokio::test]
    async fn test_send_encrypted_without_key_is_missing_key() {
        let (session, _client) = connected_pair().await;
        let err = session
            .send_encrypted(&Message::new(commands::PONG))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn test_send_encrypted_after_key_bound() {
        let (session, mut client) = connected_pair().await;
        let key = AesKey::generate();
        assert!(session.bind_aes_key(key.clone()));

        session
            .send_encrypted(&Message::new(commands::PONG))
            .await
            .unwrap();

        let keys = DecryptKeys {
            aes: Some(&key),
            rsa: None,
        };
        let received = read_frame(&mut client, keys).await.unwrap();
        assert_eq!(received.command, "pong");
    }

    #[tokio::test]
    async fn test_aes_key_binds_once() {
        let (session, _client) = connected_pair().await;
        let first = AesKey::generate();
        assert!(session.bind_aes_key(first.clone()));
        assert!(!session.bind_aes_key(AesKey::generate()));
        assert_eq!(session.aes_key().unwrap(), first);
    }

    #[tokio::test]
    async fn test_username_binds_once() {
        let (session, _client) = connected_pair().await;
        assert!(!session.is_authenticated());
        assert!(session.bind_username("alice"));
        assert!(!session.bind_username("mallory"));
        assert_eq!(session.username().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_touch_rearms_warning() {
        let (session, _client) = connected_pair().await;
        assert!(!session.mark_warned());
        assert!(session.mark_warned());

        session.touch();
        assert!(!session.mark_warned(), "touch must clear the warned flag");
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}
