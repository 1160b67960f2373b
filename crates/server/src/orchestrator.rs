//! Server orchestrator: listener, tick loop, and session liveness.
//!
//! All socket work hangs off a single cooperative tick loop. Each tick
//! admits pending connections, then sweeps every registered session:
//! readable sessions get a drain task spawned for them, quiet sessions
//! are checked against the idle thresholds. Spawned tasks land on a
//! `TaskTracker` so shutdown can wait for them to finish.

use std::sync::Arc;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::FutureExt;
use protocol::{commands, read_frame, DecryptKeys, Message, ProtocolError, RsaKeyPair};
use tokio::io::Interest;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::OwnedMutexGuard;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::{self, DispatchContext};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::store::CredentialStore;

pub struct Server {
    config: Config,
    ctx: Arc<DispatchContext>,
    keypair: Arc<RsaKeyPair>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: Config, store: Arc<dyn CredentialStore>, keypair: RsaKeyPair) -> Self {
        Self {
            config,
            ctx: Arc::new(DispatchContext {
                registry: Arc::new(SessionRegistry::new()),
                store,
            }),
            keypair: Arc::new(keypair),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the tick loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.network.listen_addr, self.config.network.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "listening");
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener. Split out so tests can bind
    /// port zero themselves.
    pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.session.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.admit_pending(&listener);
                    self.sweep_sessions();
                }
            }
        }

        info!("shutting down");
        self.tracker.close();
        self.tracker.wait().await;
        for id in self.ctx.registry.ids() {
            if let Some(session) = self.ctx.registry.remove(&id) {
                session.shutdown().await;
            }
        }
        Ok(())
    }

    /// Accept every connection already queued on the listener without
    /// blocking the tick.
    fn admit_pending(&self, listener: &TcpListener) {
        while let Some(accepted) = listener.accept().now_or_never() {
            match accepted {
                Ok((stream, peer_addr)) => {
                    let session = Arc::new(Session::new(stream, peer_addr));
                    info!(session = %session.id(), %peer_addr, "connection admitted");
                    self.ctx.registry.insert(Arc::clone(&session));
                    self.spawn_handshake(session);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Open the handshake by offering our RSA public key. The short
    /// settling delay gives the peer time to start reading.
    fn spawn_handshake(&self, session: Arc<Session>) {
        let registry = Arc::clone(&self.ctx.registry);
        let public_der = self.keypair.public_key_der().to_vec();
        let delay = self.config.session.handshake_delay();
        self.tracker.spawn(async move {
            tokio::time::sleep(delay).await;
            let offer =
                Message::new(commands::SEND_RSA).with_param("key", BASE64.encode(&public_der));
            if let Err(e) = session.send_plain(&offer).await {
                warn!(session = %session.id(), error = %e, "handshake offer failed");
                registry.remove(&session.id());
                session.shutdown().await;
            }
        });
    }

    /// One liveness pass over the registry.
    ///
    /// A session whose reader is locked already has a drain task running,
    /// which counts as activity; idle accounting only applies to sessions
    /// nobody is reading.
    fn sweep_sessions(&self) {
        let mut evict = Vec::new();

        for id in self.ctx.registry.ids() {
            let Some(session) = self.ctx.registry.get(&id) else {
                continue;
            };
            let Ok(reader) = session.reader().try_lock_owned() else {
                continue;
            };

            if reader_has_data(&reader) {
                session.touch();
                let ctx = Arc::clone(&self.ctx);
                let keypair = Arc::clone(&self.keypair);
                self.tracker.spawn(drive_session(ctx, keypair, session, reader));
                continue;
            }
            drop(reader);

            let idle = session.idle_for();
            if idle >= self.config.session.idle_evict() {
                evict.push(session);
            } else if idle >= self.config.session.idle_warn() && !session.mark_warned() {
                debug!(session = %session.id(), idle_secs = idle.as_secs(), "pinging idle session");
                let probe = Arc::clone(&session);
                self.tracker.spawn(async move {
                    if let Err(e) = probe.send_plain(&Message::new(commands::PING)).await {
                        warn!(session = %probe.id(), error = %e, "liveness ping failed");
                    }
                });
            }
        }

        for session in evict {
            info!(
                session = %session.id(),
                peer_addr = %session.peer_addr(),
                "evicting unresponsive session"
            );
            self.ctx.registry.remove(&session.id());
            let stale = session;
            self.tracker.spawn(async move { stale.shutdown().await });
        }
    }
}

/// Non-blocking readability probe on an exclusively held read half.
fn reader_has_data(reader: &OwnedReadHalf) -> bool {
    matches!(
        reader.ready(Interest::READABLE).now_or_never(),
        Some(Ok(ready)) if ready.is_readable()
    )
}

/// Drain every buffered frame from one session, dispatching each in turn.
///
/// Exclusive ownership of the read half guarantees a single drain task
/// per session. The task ends when the buffer runs dry or the transport
/// dies; the next readable tick spawns a fresh one.
async fn drive_session(
    ctx: Arc<DispatchContext>,
    keypair: Arc<RsaKeyPair>,
    session: Arc<Session>,
    mut reader: OwnedMutexGuard<OwnedReadHalf>,
) {
    loop {
        let aes = session.aes_key();
        let keys = DecryptKeys {
            aes: aes.as_ref(),
            rsa: Some(keypair.private_key()),
        };

        match read_frame(&mut *reader, keys).await {
            Ok(message) => {
                session.touch();
                if let Err(e) = dispatcher::dispatch(&ctx, &session, message).await {
                    if dispatcher::is_transport_error(&e) {
                        warn!(session = %session.id(), error = %e, "dropping session with dead transport");
                        ctx.registry.remove(&session.id());
                        session.shutdown().await;
                        return;
                    }
                    warn!(session = %session.id(), error = %e, "dispatch failed");
                }
            }
            // A stalled partial frame leaves the stream desynchronized,
            // so it is fatal along with transport errors.
            Err(
                e @ (ProtocolError::ConnectionClosed(_)
                | ProtocolError::Io(_)
                | ProtocolError::ProtocolTimeout),
            ) => {
                info!(session = %session.id(), reason = %e, "session disconnected");
                ctx.registry.remove(&session.id());
                session.shutdown().await;
                return;
            }
            // The frame was fully consumed, so the stream stays aligned
            // and the session survives a bad payload.
            Err(e) => {
                warn!(session = %session.id(), error = %e, "discarding undecodable frame");
            }
        }

        if !reader_has_data(&reader) {
            return;
        }
    }
}
