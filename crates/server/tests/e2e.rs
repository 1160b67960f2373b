//! End-to-end tests driving a real server with the client library.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use client::{ClientError, Connection};
use protocol::{RsaKeyPair, RSA_KEY_BITS};
use server::store::SqliteStore;
use server::{Config, Server};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn fast_config() -> Config {
    let mut config = Config::default();
    config.session.tick_interval_ms = 20;
    config.session.handshake_delay_ms = 10;
    config
}

async fn start_server(
    config: Config,
    db_path: &Path,
) -> (SocketAddr, CancellationToken, JoinHandle<anyhow::Result<()>>) {
    let store = Arc::new(SqliteStore::open(db_path).unwrap());
    let keypair = RsaKeyPair::generate(RSA_KEY_BITS).unwrap();
    let server = Server::new(config, store, keypair);
    let shutdown = server.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server.run_on(listener));
    (addr, shutdown, handle)
}

#[tokio::test]
async fn test_two_clients_chat_through_server() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, shutdown, _handle) = start_server(fast_config(), &dir.path().join("users.db")).await;

    let alice = Connection::connect(addr).await.unwrap();
    let bob = Connection::connect(addr).await.unwrap();

    alice.create_account("alice", "pw-a").await.unwrap();
    bob.create_account("bob", "pw-b").await.unwrap();
    assert!(alice.authenticate("alice", "pw-a").await.unwrap());
    assert!(bob.authenticate("bob", "pw-b").await.unwrap());

    let mut inbox = bob.subscribe_chat();
    alice.send_chat_message("bob", "hello bob").await.unwrap();

    let pushed = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("chat message should arrive")
        .unwrap();
    assert_eq!(pushed.param("originatinguser"), Some("alice"));
    assert_eq!(pushed.param("content"), Some("hello bob"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_presence_tracks_connection_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, shutdown, _handle) = start_server(fast_config(), &dir.path().join("users.db")).await;

    let alice = Connection::connect(addr).await.unwrap();
    alice.create_account("alice", "pw-a").await.unwrap();
    assert!(alice.authenticate("alice", "pw-a").await.unwrap());

    // Unknown user: neither exists nor online.
    let info = alice.user_info("bob").await.unwrap();
    assert!(!info.exists);
    assert!(!info.online);

    let bob = Connection::connect(addr).await.unwrap();
    bob.create_account("bob", "pw-b").await.unwrap();
    assert!(bob.authenticate("bob", "pw-b").await.unwrap());

    let info = alice.user_info("bob").await.unwrap();
    assert!(info.exists);
    assert!(info.online);

    // Disconnect bob; the server notices on a following tick.
    bob.close().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = alice.user_info("bob").await.unwrap();
        if !info.online {
            assert!(info.exists);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never noticed the disconnect"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, shutdown, _handle) = start_server(fast_config(), &dir.path().join("users.db")).await;

    let conn = Connection::connect(addr).await.unwrap();
    conn.create_account("alice", "correct").await.unwrap();
    assert!(!conn.authenticate("alice", "incorrect").await.unwrap());
    assert_eq!(conn.authenticated_username(), None);

    let err = conn.send_chat_message("bob", "hi").await.unwrap_err();
    assert!(matches!(err, ClientError::NotAuthenticated));

    shutdown.cancel();
}

#[tokio::test]
async fn test_accounts_survive_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("users.db");

    let (addr, shutdown, handle) = start_server(fast_config(), &db_path).await;
    let conn = Connection::connect(addr).await.unwrap();
    conn.create_account("alice", "pw").await.unwrap();
    assert!(conn.authenticate("alice", "pw").await.unwrap());
    conn.close().await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let (addr, shutdown, _handle) = start_server(fast_config(), &db_path).await;
    let conn = Connection::connect(addr).await.unwrap();
    assert!(conn.authenticate("alice", "pw").await.unwrap());

    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_client_connections() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, shutdown, handle) = start_server(fast_config(), &dir.path().join("users.db")).await;

    let conn = Connection::connect(addr).await.unwrap();
    assert!(conn.ping().await.is_ok());

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // With the server gone, requests fail rather than hang.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if conn.ping().await.is_err() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "client never observed the shutdown"
        );
    }
}
