//! Parley server: session hub for the encrypted chat protocol.
//!
//! The server keeps one TCP session per connected client, runs the
//! RSA-to-AES key handshake, verifies credentials against a SQLite
//! store, and relays chat messages between authenticated sessions. A
//! single cooperative tick loop drives accepts, reads, and liveness.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod store;

pub use config::Config;
pub use orchestrator::Server;
