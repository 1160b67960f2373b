//! Parley server binary.
//!
//! Loads configuration, opens the credential store, generates the
//! session RSA keypair, and runs the server until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use protocol::{RsaKeyPair, RSA_KEY_BITS};
use server::config::Config;
use server::store::SqliteStore;
use server::Server;

/// Parley chat server.
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the credential database path
    #[arg(short, long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_or_default()?
    };
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(database) = cli.database {
        config.storage.database_path = database;
    }
    config.validate()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("parley server starting");

    let store = Arc::new(SqliteStore::open(&config.storage.database_path)?);
    tracing::info!(path = %config.storage.database_path.display(), "credential store opened");

    // Fresh keypair per process; clients fetch the public half during
    // the handshake, so nothing needs to persist.
    let keypair = RsaKeyPair::generate(RSA_KEY_BITS)?;
    tracing::info!(bits = RSA_KEY_BITS, "session keypair generated");

    let server = Server::new(config, store, keypair);
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    server.run().await
}
