//! Versioned schema migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Each `Migration` is tagged
//! with the version it produces; the runner applies every step above the stored
//! version in ascending order, each in its own transaction together with the
//! version bump, so a crash between steps leaves a consistent intermediate schema.
//!
//! Column additions check `pragma_table_info` first, so re-running a step whose
//! DDL committed but whose version bump did not is harmless.

use rusqlite::Connection;
use tracing::{error, info};

/// Schema version produced by `MIGRATIONS`
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

/// Error types for schema migration
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Migration to schema version {version} failed: {source}")]
    Failed {
        version: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Database schema version {found} is newer than supported version {supported}")]
    DatabaseTooNew { found: u32, supported: u32 },
    #[error("Cannot read schema version: {0}")]
    Version(#[source] rusqlite::Error),
}

/// One step of the migration chain
#[derive(Clone, Copy)]
pub struct Migration {
    /// Schema version after this step
    pub version: u32,
    pub description: &'static str,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// The production chain, strictly ascending
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "session and CSP nonce tables",
        apply: create_base_tables,
    },
    Migration {
        version: 2,
        description: "negotiated 4DH versions",
        apply: add_4dh_versions,
    },
    Migration {
        version: 3,
        description: "last outgoing message timestamp",
        apply: add_last_outgoing_timestamp,
    },
    Migration {
        version: 4,
        description: "D2D nonce table",
        apply: create_d2d_nonce_table,
    },
];

fn create_base_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dh_session (
            my_identity TEXT NOT NULL,
            peer_identity TEXT NOT NULL,
            session_id BLOB NOT NULL,
            my_ephemeral_private_key BLOB,
            my_ephemeral_public_key BLOB NOT NULL,
            my_ratchet_2dh_counter INTEGER,
            my_ratchet_2dh_chain_key BLOB,
            my_ratchet_4dh_counter INTEGER,
            my_ratchet_4dh_chain_key BLOB,
            peer_ratchet_2dh_counter INTEGER,
            peer_ratchet_2dh_chain_key BLOB,
            peer_ratchet_4dh_counter INTEGER,
            peer_ratchet_4dh_chain_key BLOB,
            PRIMARY KEY (my_identity, peer_identity, session_id)
        );
        CREATE TABLE IF NOT EXISTS nonce_csp (
            value BLOB PRIMARY KEY NOT NULL
        ) WITHOUT ROWID;",
    )
}

fn add_4dh_versions(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "dh_session", "my_current_version_4dh", "INTEGER")?;
    add_column(conn, "dh_session", "peer_current_version_4dh", "INTEGER")
}

fn add_last_outgoing_timestamp(conn: &Connection) -> rusqlite::Result<()> {
    add_column(
        conn,
        "dh_session",
        "last_outgoing_message_timestamp",
        "INTEGER NOT NULL DEFAULT 0",
    )
}

fn create_d2d_nonce_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS nonce_d2d (
            value BLOB PRIMARY KEY NOT NULL
        ) WITHOUT ROWID;",
    )
}

/// Whether `table` already has `column`
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

// Identifiers come from the constants above, never from callers
fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> rusqlite::Result<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
}

/// Stored schema version (0 for a fresh database)
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Bring the database up to `CURRENT_SCHEMA_VERSION`
pub fn migrate(conn: &mut Connection) -> Result<u32, MigrationError> {
    run_migrations(conn, MIGRATIONS)
}

/// Apply every step of `steps` above the stored version, in order.
///
/// Returns the resulting schema version. A failing step aborts the run; the
/// steps before it stay committed.
pub fn run_migrations(conn: &mut Connection, steps: &[Migration]) -> Result<u32, MigrationError> {
    let supported = steps.last().map_or(0, |m| m.version);
    let found = schema_version(conn).map_err(MigrationError::Version)?;
    if found > supported {
        error!(found, supported, "Database schema is newer than this build");
        return Err(MigrationError::DatabaseTooNew { found, supported });
    }
    info!(found, target = supported, "Session database schema version");

    let mut current = found;
    for step in steps.iter().filter(|m| m.version > found) {
        apply_step(conn, step).map_err(|source| {
            error!(version = step.version, %source, "Schema migration failed");
            MigrationError::Failed {
                version: step.version,
                source,
            }
        })?;
        info!(version = step.version, description = step.description, "Applied schema migration");
        current = step.version;
    }
    Ok(current)
}

fn apply_step(conn: &mut Connection, step: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    (step.apply)(&tx)?;
    tx.pragma_update(None, "user_version", step.version)?;
    tx.commit()
}

// ============================================================
// TESTS
// ============================================================
