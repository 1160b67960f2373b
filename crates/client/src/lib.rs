//! Parley client library.
//!
//! Connects to a Parley server, runs the RSA-to-AES key handshake, and
//! exposes the protocol as async calls: account creation, login, chat,
//! and presence queries. Server pushes (incoming chat, keepalives) are
//! handled by a background read task; subscribe to the pushes you care
//! about with [`Connection::subscribe`].
//!
//! ```no_run
//! # async fn demo() -> client::Result<()> {
//! let conn = client::Connection::connect("127.0.0.1:9853").await?;
//! conn.create_account("alice", "hunter2").await?;
//! if conn.authenticate("alice", "hunter2").await? {
//!     conn.send_chat_message("bob", "hello").await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;

pub use connection::{Connection, UserInfo, HANDSHAKE_TIMEOUT, REQUEST_TIMEOUT};
pub use error::{ClientError, Result};
