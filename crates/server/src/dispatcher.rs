//! Command dispatcher: routes decoded messages to their handlers.
//!
//! Two tiers: handshake/auth commands any session may send, and
//! authenticated-only commands that are silently dropped for sessions
//! without a bound username. Side effects are confined to sending frames
//! and mutating session fields through the registry.

use std::sync::Arc;

use protocol::{commands, AesKey, Message, ProtocolError};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::store::CredentialStore;

/// Shared state the dispatcher needs: session routing and credentials.
pub struct DispatchContext {
    /// Live session registry, for chat relay and presence.
    pub registry: Arc<SessionRegistry>,
    /// Credential store consumed by authenticate/createaccount.
    pub store: Arc<dyn CredentialStore>,
}

/// Whether a send error means the session's transport is gone.
pub fn is_transport_error(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::ConnectionClosed(_) | ProtocolError::Io(_)
    )
}

/// Route one decoded message.
///
/// An `Err` means the *originating* session's transport failed and the
/// session should be evicted; message-level problems (store failures,
/// malformed parameters, missing keys) are handled and logged here.
pub async fn dispatch(
    ctx: &DispatchContext,
    session: &Arc<Session>,
    message: Message,
) -> protocol::Result<()> {
    debug!(
        session = %session.id(),
        command = %message.command,
        "dispatching message"
    );

    match message.command.as_str() {
        commands::PING => session.send_plain(&Message::new(commands::PONG)).await,
        // The peer answered a keepalive; the traffic itself refreshed its clock.
        commands::PONG => Ok(()),
        commands::SEND_AES => handle_send_aes(session, &message),
        commands::AUTHENTICATE => handle_authenticate(ctx, session, &message).await,
        commands::CREATE_ACCOUNT => handle_create_account(ctx, &message),
        commands::SEND_CHAT_MESSAGE => handle_chat(ctx, session, &message).await,
        commands::GET_USER_INFO => handle_user_info(ctx, session, &message).await,
        other => {
            debug!(session = %session.id(), command = other, "ignoring unknown command");
            Ok(())
        }
    }
}

fn handle_send_aes(session: &Arc<Session>, message: &Message) -> protocol::Result<()> {
    let Some(encoded) = message.param("key") else {
        warn!(session = %session.id(), "sendaes without key parameter");
        return Ok(());
    };
    match AesKey::from_base64(encoded) {
        Ok(key) => {
            if session.bind_aes_key(key) {
                debug!(session = %session.id(), "session key established");
            } else {
                warn!(session = %session.id(), "ignoring repeated sendaes");
            }
        }
        // Handshake failure policy: the session stays up but keyless, so
        // encrypted commands keep failing per-message with MissingKey.
        Err(e) => warn!(session = %session.id(), error = %e, "rejecting malformed session key"),
    }
    Ok(())
}

async fn handle_authenticate(
    ctx: &DispatchContext,
    session: &Arc<Session>,
    message: &Message,
) -> protocol::Result<()> {
    let authenticated = match (message.param("user"), message.param("password")) {
        (Some(user), Some(password)) => {
            match auth::verify(ctx.store.as_ref(), user, password) {
                Ok(ok) => {
                    if ok {
                        if session.bind_username(user) {
                            info!(session = %session.id(), username = user, "session authenticated");
                        } else {
                            debug!(session = %session.id(), "session already authenticated");
                        }
                    } else {
                        info!(session = %session.id(), username = user, "authentication failed");
                    }
                    ok
                }
                // Store trouble must read as failure, never as success.
                Err(e) => {
                    error!(session = %session.id(), error = %e, "credential store failure during authenticate");
                    false
                }
            }
        }
        _ => {
            warn!(session = %session.id(), "authenticate missing user or password parameter");
            false
        }
    };

    let reply = Message::new(commands::AUTHENTICATION_RESULT).with_param(
        "result",
        if authenticated { "success" } else { "failure" },
    );
    session.send_encrypted(&reply).await
}

fn handle_create_account(ctx: &DispatchContext, message: &Message) -> protocol::Result<()> {
    let (Some(user), Some(password)) = (message.param("user"), message.param("password")) else {
        warn!("createaccount missing user or password parameter");
        return Ok(());
    };
    match auth::create_account(ctx.store.as_ref(), user, password) {
        Ok(()) => info!(username = user, "account created"),
        Err(e) => error!(username = user, error = %e, "account creation failed"),
    }
    Ok(())
}

async fn handle_chat(
    ctx: &DispatchContext,
    session: &Arc<Session>,
    message: &Message,
) -> protocol::Result<()> {
    let Some(sender) = session.username() else {
        warn!(session = %session.id(), "dropping sendchatmessage from unauthenticated session");
        return Ok(());
    };
    let (Some(target), Some(content)) = (message.param("target"), message.param("content")) else {
        warn!(session = %session.id(), "sendchatmessage missing target or content parameter");
        return Ok(());
    };

    let Some(peer) = ctx.registry.find_by_username(target) else {
        // Offline targets get no error back to the sender; offline
        // delivery is a future extension.
        debug!(target, "chat target not online, dropping message");
        return Ok(());
    };

    let relay = Message::new(commands::RECEIVE_CHAT_MESSAGE)
        .with_param("originatinguser", sender)
        .with_param("content", content);

    if let Err(e) = peer.send_encrypted(&relay).await {
        if is_transport_error(&e) {
            warn!(session = %peer.id(), error = %e, "removing chat target with dead transport");
            ctx.registry.remove(&peer.id());
            peer.shutdown().await;
        } else {
            warn!(session = %peer.id(), error = %e, "failed to relay chat message");
        }
    }
    Ok(())
}

async fn handle_user_info(
    ctx: &DispatchContext,
    session: &Arc<Session>,
    message: &Message,
) -> protocol::Result<()> {
    if !session.is_authenticated() {
        warn!(session = %session.id(), "dropping getuserinfo from unauthenticated session");
        return Ok(());
    }
    let Some(name) = message.param("name") else {
        warn!(session = %session.id(), "getuserinfo missing name parameter");
        return Ok(());
    };

    let online = ctx.registry.find_by_username(name).is_some();
    let exists = match ctx.store.get(name) {
        Ok(record) => record.is_some(),
        Err(e) => {
            error!(error = %e, "credential store failure during getuserinfo");
            false
        }
    };

    let reply = Message::new(commands::SEND_USER_INFO)
        .with_param("online", online.to_string())
        .with_param("exists", exists.to_string());
    session.send_encrypted(&reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use protocol::{read_frame, DecryptKeys};
    use tokio::net::{TcpListener, TcpStream};

    struct Fixture {
        ctx: DispatchContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ctx: DispatchContext {
                    registry: Arc::new(SessionRegistry::new()),
                    store: Arc::new(SqliteStore::open_in_memory().unwrap()),
                },
            }
        }

        async fn session(&self) -> (Arc<Session>, TcpStream) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let client = TcpStream::connect(addr).await.unwrap();
            let (stream, peer) = listener.accept().await.unwrap();
            let session = Arc::new(Session::new(stream, peer));
            self.ctx.registry.insert(Arc::clone(&session));
            (session, client)
        }

        /// Session with a bound AES key, returning the client-side key copy.
        async fn keyed_session(&self) -> (Arc<Session>, TcpStream, AesKey) {
            let (session, client) = self.session().await;
            let key = AesKey::generate();
            dispatch(
                &self.ctx,
                &session,
                Message::new(commands::SEND_AES).with_param("key", key.to_base64()),
            )
            .await
            .unwrap();
            (session, client, key)
        }
    }

    async fn expect_frame(client: &mut TcpStream, key: Option<&AesKey>) -> Message {
        let keys = DecryptKeys {
            aes: key,
            rsa: None,
        };
        read_frame(client, keys).await.unwrap()
    }

    #[tokio::test]
    async fn test_ping_yields_exactly_one_pong() {
        let fx = Fixture::new();
        let (session, mut client) = fx.session().await;

        dispatch(&fx.ctx, &session, Message::new(commands::PING))
            .await
            .unwrap();

        let reply = expect_frame(&mut client, None).await;
        assert_eq!(reply.command, "pong");
    }

    #[tokio::test]
    async fn test_sendaes_binds_key_once() {
        let fx = Fixture::new();
        let (session, _client, key) = fx.keyed_session().await;
        assert_eq!(session.aes_key().unwrap(), key);

        // A second sendaes is ignored; the original key stays bound.
        dispatch(
            &fx.ctx,
            &session,
            Message::new(commands::SEND_AES).with_param("key", AesKey::generate().to_base64()),
        )
        .await
        .unwrap();
        assert_eq!(session.aes_key().unwrap(), key);
    }

    #[tokio::test]
    async fn test_sendaes_bad_base64_leaves_session_keyless() {
        let fx = Fixture::new();
        let (session, _client) = fx.session().await;

        dispatch(
            &fx.ctx,
            &session,
            Message::new(commands::SEND_AES).with_param("key", "!!not-base64!!"),
        )
        .await
        .unwrap();
        assert!(session.aes_key().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_success_binds_username_and_replies() {
        let fx = Fixture::new();
        auth::create_account(fx.ctx.store.as_ref(), "alice", "hunter2").unwrap();
        let (session, mut client, key) = fx.keyed_session().await;

        dispatch(
            &fx.ctx,
            &session,
            Message::new(commands::AUTHENTICATE)
                .with_param("user", "alice")
                .with_param("password", "hunter2"),
        )
        .await
        .unwrap();

        let reply = expect_frame(&mut client, Some(&key)).await;
        assert_eq!(reply.command, "authenticationresult");
        assert_eq!(reply.param("result"), Some("success"));
        assert_eq!(session.username().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_authenticate_wrong_password_replies_failure() {
        let fx = Fixture::new();
        auth::create_account(fx.ctx.store.as_ref(), "alice", "hunter2").unwrap();
        let (session, mut client, key) = fx.keyed_session().await;

        dispatch(
            &fx.ctx,
            &session,
            Message::new(commands::AUTHENTICATE)
                .with_param("user", "alice")
                .with_param("password", "wrong"),
        )
        .await
        .unwrap();

        let reply = expect_frame(&mut client, Some(&key)).await;
        assert_eq!(reply.param("result"), Some("failure"));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_before_handshake_is_missing_key() {
        let fx = Fixture::new();
        auth::create_account(fx.ctx.store.as_ref(), "alice", "hunter2").unwrap();
        let (session, _client) = fx.session().await;

        let err = dispatch(
            &fx.ctx,
            &session,
            Message::new(commands::AUTHENTICATE)
                .with_param("user", "alice")
                .with_param("password", "hunter2"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingKey { .. }));
        assert!(!is_transport_error(&err));
    }

    #[tokio::test]
    async fn test_createaccount_persists_credentials() {
        let fx = Fixture::new();
        let (session, _client) = fx.session().await;

        dispatch(
            &fx.ctx,
            &session,
            Message::new(commands::CREATE_ACCOUNT)
                .with_param("user", "carol")
                .with_param("password", "s3cret"),
        )
        .await
        .unwrap();

        assert!(auth::verify(fx.ctx.store.as_ref(), "carol", "s3cret").unwrap());
    }

    #[tokio::test]
    async fn test_chat_routes_to_online_target() {
        let fx = Fixture::new();
        let (sender, _sender_client, _skey) = fx.keyed_session().await;
        let (target, mut target_client, tkey) = fx.keyed_session().await;
        sender.bind_username("alice");
        target.bind_username("bob");

        dispatch(
            &fx.ctx,
            &sender,
            Message::new(commands::SEND_CHAT_MESSAGE)
                .with_param("target", "bob")
                .with_param("content", "hi"),
        )
        .await
        .unwrap();

        let relayed = expect_frame(&mut target_client, Some(&tkey)).await;
        assert_eq!(relayed.command, "receivechatmessage");
        assert_eq!(relayed.param("originatinguser"), Some("alice"));
        assert_eq!(relayed.param("content"), Some("hi"));
    }

    #[tokio::test]
    async fn test_chat_from_unauthenticated_session_is_dropped() {
        let fx = Fixture::new();
        let (sender, _sc, _sk) = fx.keyed_session().await;
        let (target, mut target_client, tkey) = fx.keyed_session().await;
        target.bind_username("bob");

        dispatch(
            &fx.ctx,
            &sender,
            Message::new(commands::SEND_CHAT_MESSAGE)
                .with_param("target", "bob")
                .with_param("content", "hi"),
        )
        .await
        .unwrap();

        // Nothing must reach the target; prove it by sending a marker next.
        target.send_encrypted(&Message::new("marker")).await.unwrap();
        let next = expect_frame(&mut target_client, Some(&tkey)).await;
        assert_eq!(next.command, "marker");
    }

    #[tokio::test]
    async fn test_chat_to_offline_target_is_silent() {
        let fx = Fixture::new();
        auth::create_account(fx.ctx.store.as_ref(), "bob", "pw").unwrap();
        let (sender, mut sender_client, skey) = fx.keyed_session().await;
        sender.bind_username("alice");

        dispatch(
            &fx.ctx,
            &sender,
            Message::new(commands::SEND_CHAT_MESSAGE)
                .with_param("target", "bob")
                .with_param("content", "hi"),
        )
        .await
        .unwrap();

        // The sender gets no error frame back.
        sender.send_encrypted(&Message::new("marker")).await.unwrap();
        let next = expect_frame(&mut sender_client, Some(&skey)).await;
        assert_eq!(next.command, "marker");
    }

    #[tokio::test]
    async fn test_getuserinfo_combines_registry_and_store() {
        let fx = Fixture::new();
        auth::create_account(fx.ctx.store.as_ref(), "bob", "pw").unwrap();
        let (asker, mut asker_client, akey) = fx.keyed_session().await;
        asker.bind_username("alice");

        // bob exists but is offline.
        dispatch(
            &fx.ctx,
            &asker,
            Message::new(commands::GET_USER_INFO).with_param("name", "bob"),
        )
        .await
        .unwrap();
        let reply = expect_frame(&mut asker_client, Some(&akey)).await;
        assert_eq!(reply.command, "senduserinfo");
        assert_eq!(reply.param("exists"), Some("true"));
        assert_eq!(reply.param("online"), Some("false"));

        // bob comes online.
        let (bob, _bob_client, _bkey) = fx.keyed_session().await;
        bob.bind_username("bob");
        dispatch(
            &fx.ctx,
            &asker,
            Message::new(commands::GET_USER_INFO).with_param("name", "bob"),
        )
        .await
        .unwrap();
        let reply = expect_frame(&mut asker_client, Some(&akey)).await;
        assert_eq!(reply.param("online"), Some("true"));

        // Nobody by that name anywhere.
        dispatch(
            &fx.ctx,
            &asker,
            Message::new(commands::GET_USER_INFO).with_param("name", "nobody"),
        )
        .await
        .unwrap();
        let reply = expect_frame(&mut asker_client, Some(&akey)).await;
        assert_eq!(reply.param("exists"), Some("false"));
        assert_eq!(reply.param("online"), Some("false"));
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let fx = Fixture::new();
        let (session, _client) = fx.session().await;
        dispatch(&fx.ctx, &session, Message::new("frobnicate"))
            .await
            .unwrap();
    }
}
