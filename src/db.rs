//! Storage engine handle shared by the session and nonce stores.
//!
//! A `Database` owns one SQLite connection behind a mutex: each store call takes
//! the guard for the duration of its statements, which serializes access the way
//! SQLite's own database lock would across connections. Multi-statement writes run
//! in a transaction on that connection.
//!
//! Opening a database applies the configured busy timeout and journal mode, then
//! runs the migration chain to completion before the handle is returned.

use std::sync::Mutex;

use rusqlite::Connection;
use tracing::debug;

use crate::config::StoreConfig;
use crate::migration::{self, MigrationError};
use crate::session::{DhSessionId, SessionError};

/// Error types for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Schema migration failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("Database connection poisoned by a panicking thread")]
    Poisoned,
    #[error("Value out of range for {0}")]
    OutOfRange(&'static str),
    #[error("Several sessions with {peer_identity} exist, a session id is required")]
    AmbiguousSession { peer_identity: String },
    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonce { expected: usize, actual: usize },
    #[error("Protocol version downgrade for session {session_id}")]
    VersionDowngrade { session_id: DhSessionId },
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Migrated database shared by the stores
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    schema_version: u32,
}

impl Database {
    /// Open (or create) the database described by `config` and migrate it
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut conn = match config.path() {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(config.busy_timeout())?;
        if config.wal() {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(%mode, "Journal mode set");
        }

        let schema_version = migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            schema_version,
        })
    }

    /// Private in-memory database with default settings
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Schema version after migration
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Run `f` with exclusive use of the connection
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }
}

// ============================================================
// TESTS
// ============================================================
