//! Replay-protection nonce store.
//!
//! Nonces seen on the chat server protocol (`NonceScope::Csp`) and the
//! device-to-device channel (`NonceScope::D2d`) live in separate tables. Each
//! table is a set: presence of a value means "already seen".
//!
//! # Security Properties
//!
//! - **Hashed at rest**: nonces are stored as HMAC-SHA256 keyed by the current
//!   identity, so nonce databases of different identities cannot be correlated
//! - **Legacy raw values**: without an identity the raw nonce is stored; `exists`
//!   matches both forms
//! - **Duplicates are not errors**: storing a known nonce reports `false`

use std::sync::Arc;

use rusqlite::{params, ErrorCode};
use tracing::{debug, warn};

use crate::crypto::{hash_nonce, KEY_SIZE};
use crate::db::{Database, StoreError};

/// Length of a raw protocol nonce
pub const NONCE_LENGTH: usize = 24;

/// Length of a stored hashed nonce
pub const HASHED_NONCE_LENGTH: usize = KEY_SIZE;

/// Which protocol a nonce belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonceScope {
    /// Chat server protocol
    Csp,
    /// Device-to-device protocol
    D2d,
}

impl NonceScope {
    fn table(self) -> &'static str {
        match self {
            NonceScope::Csp => "nonce_csp",
            NonceScope::D2d => "nonce_d2d",
        }
    }
}

/// Supplies the identity that keys nonce hashing
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<String>;
}

impl<F> IdentityProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_identity(&self) -> Option<String> {
        self()
    }
}

/// Nonce store on top of a shared `Database`
pub struct NonceStore {
    db: Arc<Database>,
    identity: Arc<dyn IdentityProvider>,
}

fn check_length(nonce: &[u8]) -> Result<(), StoreError> {
    if nonce.len() != NONCE_LENGTH {
        return Err(StoreError::InvalidNonce {
            expected: NONCE_LENGTH,
            actual: nonce.len(),
        });
    }
    Ok(())
}

fn to_i64(value: usize, what: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(what))
}

impl NonceStore {
    #[must_use]
    pub fn new(db: Arc<Database>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { db, identity }
    }

    /// Whether `nonce` was recorded, as raw value or hashed for the current identity
    pub fn exists(&self, scope: NonceScope, nonce: &[u8]) -> Result<bool, StoreError> {
        check_length(nonce)?;
        let hashed = self
            .identity
            .current_identity()
            .map(|identity| hash_nonce(&identity, nonce));
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE value = ?1 OR value = ?2)",
            scope.table()
        );
        self.db.with_conn(|conn| {
            let found: bool = match hashed {
                Some(hashed) => conn.query_row(&sql, params![nonce, &hashed[..]], |row| row.get(0))?,
                None => conn.query_row(&sql, params![nonce, nonce], |row| row.get(0))?,
            };
            Ok(found)
        })
    }

    /// Record `nonce`; `false` if it was already present
    pub fn store(&self, scope: NonceScope, nonce: &[u8]) -> Result<bool, StoreError> {
        check_length(nonce)?;
        let value: Vec<u8> = match self.identity.current_identity() {
            Some(identity) => hash_nonce(&identity, nonce).to_vec(),
            None => nonce.to_vec(),
        };
        let sql = format!("INSERT INTO {} (value) VALUES (?1)", scope.table());
        self.db.with_conn(|conn| match conn.execute(&sql, [&value]) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                warn!(?scope, "Duplicate nonce");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        })
    }

    /// Number of stored nonces in `scope`
    pub fn count(&self, scope: NonceScope) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", scope.table());
        let count: i64 = self
            .db
            .with_conn(|conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))?;
        u64::try_from(count).map_err(|_| StoreError::OutOfRange("nonce count"))
    }

    /// One page of stored values as lowercase hex, ordered by value
    pub fn export_chunk(
        &self,
        scope: NonceScope,
        size: usize,
        offset: usize,
    ) -> Result<Vec<String>, StoreError> {
        let limit = to_i64(size, "chunk size")?;
        let offset = to_i64(offset, "chunk offset")?;
        let sql = format!(
            "SELECT value FROM {} ORDER BY value LIMIT ?1 OFFSET ?2",
            scope.table()
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit, offset], |row| row.get::<_, Vec<u8>>(0))?;
            let mut chunk = Vec::new();
            for value in rows {
                chunk.push(hex::encode(value?));
            }
            Ok(chunk)
        })
    }

    /// Insert already hashed nonces (hex encoded) received from another device.
    ///
    /// Rows that are not 32-byte hex values, or that the engine refuses to
    /// insert, are skipped and make the result `false`; values already present
    /// count as success.
    pub fn import_hashed<S: AsRef<str>>(
        &self,
        scope: NonceScope,
        hashes: &[S],
    ) -> Result<bool, StoreError> {
        let sql = format!("INSERT OR IGNORE INTO {} (value) VALUES (?1)", scope.table());
        let (imported, failed) = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut imported = 0usize;
            let mut failed = 0usize;
            {
                let mut stmt = tx.prepare(&sql)?;
                for hash in hashes {
                    let bytes = match hex::decode(hash.as_ref()) {
                        Ok(bytes) if bytes.len() == HASHED_NONCE_LENGTH => bytes,
                        Ok(bytes) => {
                            warn!(?scope, len = bytes.len(), "Rejected imported nonce of wrong length");
                            failed += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!(?scope, error = %e, "Rejected imported nonce with invalid hex");
                            failed += 1;
                            continue;
                        }
                    };
                    match stmt.execute([&bytes]) {
                        Ok(inserted) => imported += inserted,
                        Err(e) => {
                            warn!(?scope, error = %e, "Failed to insert imported nonce");
                            failed += 1;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok((imported, failed))
        })?;
        debug!(?scope, total = hashes.len(), imported, failed, "Imported nonces");
        Ok(failed == 0)
    }

    /// Remove every nonce in `scope`, returning how many were deleted
    pub fn delete_all(&self, scope: NonceScope) -> Result<usize, StoreError> {
        let sql = format!("DELETE FROM {}", scope.table());
        let deleted = self.db.with_conn(|conn| Ok(conn.execute(&sql, [])?))?;
        debug!(?scope, deleted, "Deleted all nonces");
        Ok(deleted)
    }
}

// ============================================================
// TESTS
// ============================================================
