//! Connection handling: handshake, request correlation, and push routing.
//!
//! A [`Connection`] owns one TCP stream to the server. The write half is
//! shared behind a mutex; the read half belongs to a background task
//! that routes every inbound frame either to a waiting request
//! correlator or to push observers registered per command.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use protocol::{
    commands, encode_frame, read_frame, AesKey, DecryptKeys, FrameCipher, Message, ProtocolError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// How long to wait for the server's RSA offer when connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a correlated reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One pending request per expected reply command.
type Correlators = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Push subscriptions, fanned out per command.
type Observers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>>;

/// Presence and existence answer for one username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserInfo {
    pub exists: bool,
    pub online: bool,
}

/// An established, encrypted connection to a Parley server.
pub struct Connection {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    aes_key: AesKey,
    correlators: Correlators,
    observers: Observers,
    username: Mutex<Option<String>>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    /// Connect and complete the key handshake.
    ///
    /// Waits for the server's RSA public key, generates a fresh AES
    /// session key, and sends it back under RSA. Everything after that
    /// travels AES encrypted.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;

        let offer = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_frame(&mut stream, DecryptKeys::default()),
        )
        .await
        .map_err(|_| ClientError::HandshakeFailed("no rsa offer from server".to_string()))??;
        if offer.command != commands::SEND_RSA {
            return Err(ClientError::HandshakeFailed(format!(
                "expected '{}', got '{}'",
                commands::SEND_RSA,
                offer.command
            )));
        }
        let server_der = offer
            .param("key")
            .ok_or_else(|| ClientError::HandshakeFailed("rsa offer missing key".to_string()))
            .and_then(|encoded| {
                BASE64.decode(encoded).map_err(|e| {
                    ClientError::HandshakeFailed(format!("undecodable rsa offer: {e}"))
                })
            })?;

        let aes_key = AesKey::generate();
        let hello = Message::new(commands::SEND_AES).with_param("key", aes_key.to_base64());
        let frame = encode_frame(
            &hello,
            FrameCipher::Rsa {
                public_key_der: &server_der,
            },
        )?;
        stream.write_all(&frame).await?;

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let correlators: Correlators = Arc::default();
        let observers: Observers = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            read_half,
            aes_key.clone(),
            Arc::clone(&writer),
            Arc::clone(&correlators),
            Arc::clone(&observers),
            Arc::clone(&closed),
        ));

        Ok(Self {
            writer,
            aes_key,
            correlators,
            observers,
            username: Mutex::new(None),
            closed,
            reader_task,
        })
    }

    /// Verify credentials with the server.
    ///
    /// A reply that never arrives counts as a failed login rather than
    /// an error, so callers see one boolean either way.
    pub async fn authenticate(&self, user: &str, password: &str) -> Result<bool> {
        let request = Message::new(commands::AUTHENTICATE)
            .with_param("user", user)
            .with_param("password", password);
        match self
            .send_request(&request, commands::AUTHENTICATION_RESULT, REQUEST_TIMEOUT)
            .await
        {
            Ok(reply) => {
                let accepted = reply.param("result") == Some("success");
                if accepted {
                    *lock(&self.username) = Some(user.to_string());
                }
                Ok(accepted)
            }
            Err(ClientError::RequestTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Register an account. The server sends no acknowledgement; follow
    /// up with [`authenticate`](Self::authenticate) to confirm.
    pub async fn create_account(&self, user: &str, password: &str) -> Result<()> {
        let request = Message::new(commands::CREATE_ACCOUNT)
            .with_param("user", user)
            .with_param("password", password);
        self.send(&request).await
    }

    /// Send a chat message to another user. Requires a prior successful
    /// authenticate on this connection.
    pub async fn send_chat_message(&self, target: &str, content: &str) -> Result<()> {
        if lock(&self.username).is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        let request = Message::new(commands::SEND_CHAT_MESSAGE)
            .with_param("target", target)
            .with_param("content", content);
        self.send(&request).await
    }

    /// Ask whether a user exists and whether they are online right now.
    pub async fn user_info(&self, name: &str) -> Result<UserInfo> {
        if lock(&self.username).is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        let request = Message::new(commands::GET_USER_INFO).with_param("name", name);
        let reply = self
            .send_request(&request, commands::SEND_USER_INFO, REQUEST_TIMEOUT)
            .await?;
        Ok(UserInfo {
            exists: reply.param("exists") == Some("true"),
            online: reply.param("online") == Some("true"),
        })
    }

    /// Round-trip a keepalive.
    pub async fn ping(&self) -> Result<()> {
        self.send_request(&Message::new(commands::PING), commands::PONG, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Receive every inbound message with the given command that no
    /// correlator claimed. Dropping the receiver ends the subscription.
    pub fn subscribe(&self, command: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.observers)
            .entry(command.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Subscribe to chat messages pushed by the server.
    pub fn subscribe_chat(&self) -> mpsc::UnboundedReceiver<Message> {
        self.subscribe(commands::RECEIVE_CHAT_MESSAGE)
    }

    /// Username bound by the last successful authenticate, if any.
    pub fn authenticated_username(&self) -> Option<String> {
        lock(&self.username).clone()
    }

    /// Stop the read loop and close the socket.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader_task.abort();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "socket already closed");
        }
    }

    /// Send one request and wait for the reply command, with a timeout.
    async fn send_request(
        &self,
        request: &Message,
        reply_command: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        // A stale waiter for the same reply command is displaced; its
        // receiver resolves as closed.
        lock(&self.correlators).insert(reply_command.to_string(), tx);

        self.send(request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                lock(&self.correlators).remove(reply_command);
                Err(ClientError::RequestTimeout {
                    command: request.command.clone(),
                })
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionClosed);
        }
        let frame = encode_frame(message, FrameCipher::Aes(&self.aes_key))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background task: decode inbound frames and route each one.
async fn read_loop(
    mut reader: OwnedReadHalf,
    key: AesKey,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    correlators: Correlators,
    observers: Observers,
    closed: Arc<AtomicBool>,
) {
    loop {
        let keys = DecryptKeys {
            aes: Some(&key),
            rsa: None,
        };
        match read_frame(&mut reader, keys).await {
            Ok(message) => route(message, &key, &writer, &correlators, &observers).await,
            Err(
                e @ (ProtocolError::ConnectionClosed(_)
                | ProtocolError::Io(_)
                | ProtocolError::ProtocolTimeout),
            ) => {
                debug!(reason = %e, "connection read loop ending");
                closed.store(true, Ordering::Release);
                // Waiters see their channel close instead of hanging
                // until their timeout.
                lock(&correlators).clear();
                return;
            }
            Err(e) => warn!(error = %e, "discarding undecodable frame"),
        }
    }
}

async fn route(
    message: Message,
    key: &AesKey,
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    correlators: &Correlators,
    observers: &Observers,
) {
    // Server keepalive; answer without involving the application. The
    // frame still flows through correlator/observer routing below.
    let answered_keepalive = message.command == commands::PING;
    if answered_keepalive {
        match encode_frame(&Message::new(commands::PONG), FrameCipher::Aes(key)) {
            Ok(frame) => {
                let mut writer = writer.lock().await;
                if let Err(e) = writer.write_all(&frame).await {
                    warn!(error = %e, "failed to answer keepalive");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode keepalive answer"),
        }
    }

    // Observers run independently of correlation: a reply that resolves
    // a waiter is still fanned out to any subscription for its command.
    let observed = {
        let mut observers = lock(observers);
        match observers.get_mut(&message.command) {
            Some(list) => {
                list.retain(|tx| tx.send(message.clone()).is_ok());
                !list.is_empty()
            }
            None => false,
        }
    };

    if let Some(tx) = lock(correlators).remove(&message.command) {
        // Receiver may have timed out and gone away; that is fine.
        let _ = tx.send(message);
    } else if !observed && !answered_keepalive {
        debug!(command = %message.command, "dropping unsolicited message");
    }
}
