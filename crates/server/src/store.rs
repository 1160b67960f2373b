//! Credential record storage.
//!
//! The protocol layer treats the store as an external collaborator with a
//! narrow put/get surface; [`SqliteStore`] is the shipped implementation.
//! Username uniqueness is enforced here (primary key, last write wins), not
//! by the verifier.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Path error.
    #[error("invalid database path: {0}")]
    InvalidPath(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One stored credential: username, salted password hash, and salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Account name, unique within the store.
    pub username: String,
    /// `SHA256(password || salt)`.
    pub password_hash: Vec<u8>,
    /// Random salt generated at account creation.
    pub salt: Vec<u8>,
}

/// Keyed credential record store.
///
/// Implementations must be safe to share across the dispatcher tasks.
pub trait CredentialStore: Send + Sync {
    /// Insert or replace the record for its username.
    fn put(&self, record: &CredentialRecord) -> StoreResult<()>;

    /// Fetch the record for a username, `None` if absent.
    fn get(&self, username: &str) -> StoreResult<Option<CredentialRecord>>;
}

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// SQLite-backed credential store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories as needed and applies pending migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidPath(format!(
                        "failed to create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database, useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.lock();
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database schema version {version} is newer than supported {CURRENT_SCHEMA_VERSION}"
            )));
        }

        if version < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS users (
                    name TEXT PRIMARY KEY,
                    hash BLOB NOT NULL,
                    salt BLOB NOT NULL
                )",
                [],
            )?;
            conn.execute_batch(&format!("PRAGMA user_version = {CURRENT_SCHEMA_VERSION}"))?;
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a previous statement panicked; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CredentialStore for SqliteStore {
    fn put(&self, record: &CredentialRecord) -> StoreResult<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO users (name, hash, salt) VALUES (?1, ?2, ?3)",
            params![record.username, record.password_hash, record.salt],
        )?;
        Ok(())
    }

    fn get(&self, username: &str) -> StoreResult<Option<CredentialRecord>> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT name, hash, salt FROM users WHERE name = ?1",
                params![username],
                |row| {
                    Ok(CredentialRecord {
                        username: row.get(0)?,
                        password_hash: row.get(1)?,
                        salt: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
