//! Durable DH session store.
//!
//! Sessions are keyed by `(my_identity, peer_identity, session_id)`. Rows are
//! decoded one at a time; a row that does not describe a valid `DhSession` is
//! reported to the `SessionErrorHandler` and skipped, so a single corrupt session
//! never hides the others.
//!
//! # Security Properties
//!
//! - **Best-session order**: sessions with a 4DH ratchet come first, then
//!   ascending session id bytes. Both peers pick the same session.
//! - **No version downgrade**: a write that lowers a stored 4DH version is
//!   rejected inside the write transaction
//! - **No key material in logs**: only peer identity and session id are logged

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::db::{Database, StoreError};
use crate::session::{
    DhSession, DhSessionId, IllegalSessionStateError, RatchetRecord, SessionRecord,
};

/// Receives sessions that could not be restored so the caller can renegotiate
pub trait SessionErrorHandler: Send + Sync {
    fn on_illegal_session_state(&self, peer_identity: &str, session_id: &DhSessionId);
}

impl<F> SessionErrorHandler for F
where
    F: Fn(&str, &DhSessionId) + Send + Sync,
{
    fn on_illegal_session_state(&self, peer_identity: &str, session_id: &DhSessionId) {
        self(peer_identity, session_id);
    }
}

const SESSION_COLUMNS: &str = "my_identity, peer_identity, session_id, \
    my_ephemeral_private_key, my_ephemeral_public_key, \
    my_current_version_4dh, peer_current_version_4dh, \
    my_ratchet_2dh_counter, my_ratchet_2dh_chain_key, \
    my_ratchet_4dh_counter, my_ratchet_4dh_chain_key, \
    peer_ratchet_2dh_counter, peer_ratchet_2dh_chain_key, \
    peer_ratchet_4dh_counter, peer_ratchet_4dh_chain_key, \
    last_outgoing_message_timestamp";

/// Why a row did not produce a session record
enum RowError {
    /// Engine failure, aborts the query
    Engine(rusqlite::Error),
    /// Column values unusable, the row is illegal
    Malformed(String),
}

impl From<rusqlite::Error> for RowError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => RowError::Malformed(e.to_string()),
            e => RowError::Engine(e),
        }
    }
}

/// Outcome of decoding one row
enum Decoded {
    Session(DhSession),
    Illegal(IllegalSessionStateError),
    /// Row without a usable key, nothing to report to the handler
    Unidentifiable,
}

fn ratchet_columns(
    row: &Row<'_>,
    counter: &str,
    chain_key: &str,
) -> Result<Option<RatchetRecord>, RowError> {
    let counter_value: Option<i64> = row.get(counter)?;
    let key_value: Option<Vec<u8>> = row.get(chain_key)?;
    match (counter_value, key_value) {
        (None, None) => Ok(None),
        (Some(counter), Some(chain_key)) => Ok(Some(RatchetRecord { counter, chain_key })),
        _ => Err(RowError::Malformed(format!(
            "{counter} and {chain_key} must be set together"
        ))),
    }
}

fn read_record(
    row: &Row<'_>,
    id: DhSessionId,
    my_identity: String,
    peer_identity: String,
) -> Result<SessionRecord, RowError> {
    Ok(SessionRecord {
        id,
        my_identity,
        peer_identity,
        my_ephemeral_private_key: row.get("my_ephemeral_private_key")?,
        my_ephemeral_public_key: row.get("my_ephemeral_public_key")?,
        my_current_version_4dh: row.get("my_current_version_4dh")?,
        peer_current_version_4dh: row.get("peer_current_version_4dh")?,
        my_ratchet_2dh: ratchet_columns(row, "my_ratchet_2dh_counter", "my_ratchet_2dh_chain_key")?,
        my_ratchet_4dh: ratchet_columns(row, "my_ratchet_4dh_counter", "my_ratchet_4dh_chain_key")?,
        peer_ratchet_2dh: ratchet_columns(
            row,
            "peer_ratchet_2dh_counter",
            "peer_ratchet_2dh_chain_key",
        )?,
        peer_ratchet_4dh: ratchet_columns(
            row,
            "peer_ratchet_4dh_counter",
            "peer_ratchet_4dh_chain_key",
        )?,
        last_outgoing_message_timestamp: row.get("last_outgoing_message_timestamp")?,
    })
}

fn read_key(row: &Row<'_>) -> Result<(String, String, Vec<u8>), RowError> {
    Ok((row.get("my_identity")?, row.get("peer_identity")?, row.get("session_id")?))
}

fn decode_row(row: &Row<'_>) -> Result<Decoded, rusqlite::Error> {
    let (my_identity, peer_identity, raw_id) = match read_key(row) {
        Ok(key) => key,
        Err(RowError::Engine(e)) => return Err(e),
        Err(RowError::Malformed(reason)) => {
            warn!(%reason, "Skipping session row with unreadable key");
            return Ok(Decoded::Unidentifiable);
        }
    };
    let Some(id) = DhSessionId::from_slice(&raw_id) else {
        warn!(
            peer = %peer_identity,
            len = raw_id.len(),
            "Skipping session row with malformed session id"
        );
        return Ok(Decoded::Unidentifiable);
    };

    let record = match read_record(row, id, my_identity, peer_identity.clone()) {
        Ok(record) => record,
        Err(RowError::Engine(e)) => return Err(e),
        Err(RowError::Malformed(reason)) => {
            return Ok(Decoded::Illegal(IllegalSessionStateError {
                peer_identity,
                session_id: id,
                reason,
            }))
        }
    };
    Ok(match DhSession::restore(&record) {
        Ok(session) => Decoded::Session(session),
        Err(e) => Decoded::Illegal(e),
    })
}

fn ratchet_counter(ratchet: Option<&RatchetRecord>) -> Option<i64> {
    ratchet.map(|r| r.counter)
}

fn ratchet_key(ratchet: Option<&RatchetRecord>) -> Option<&[u8]> {
    ratchet.map(|r| r.chain_key.as_slice())
}

/// Valid sessions of a query plus the rows that failed to restore
#[derive(Default)]
struct Scan {
    sessions: Vec<DhSession>,
    illegal: Vec<IllegalSessionStateError>,
}

/// Decode rows of `sql` lazily until `limit` valid sessions were found
fn scan(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    limit: Option<usize>,
) -> Result<Scan, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut scan = Scan::default();
    while let Some(row) = rows.next()? {
        match decode_row(row)? {
            Decoded::Session(session) => {
                scan.sessions.push(session);
                if limit.is_some_and(|limit| scan.sessions.len() >= limit) {
                    break;
                }
            }
            Decoded::Illegal(e) => scan.illegal.push(e),
            Decoded::Unidentifiable => {}
        }
    }
    Ok(scan)
}

/// Session store on top of a shared `Database`
pub struct SessionStore {
    db: Arc<Database>,
    error_handler: Arc<dyn SessionErrorHandler>,
}

impl SessionStore {
    #[must_use]
    pub fn new(db: Arc<Database>, error_handler: Arc<dyn SessionErrorHandler>) -> Self {
        Self { db, error_handler }
    }

    // Called after the connection guard is released
    fn report(&self, illegal: &[IllegalSessionStateError]) {
        for e in illegal {
            warn!(
                peer = %e.peer_identity,
                session = %e.session_id,
                reason = %e.reason,
                "Illegal session state"
            );
            self.error_handler
                .on_illegal_session_state(&e.peer_identity, &e.session_id);
        }
    }

    fn run_scan(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        limit: Option<usize>,
    ) -> Result<Vec<DhSession>, StoreError> {
        let scan = self.db.with_conn(|conn| scan(conn, sql, params, limit))?;
        self.report(&scan.illegal);
        Ok(scan.sessions)
    }

    /// Look up one session.
    ///
    /// Without a session id exactly one session may exist for the pair;
    /// several valid ones fail with `StoreError::AmbiguousSession`.
    pub fn get_session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: Option<&DhSessionId>,
    ) -> Result<Option<DhSession>, StoreError> {
        let mut sessions = match session_id {
            Some(id) => self.run_scan(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM dh_session
                     WHERE my_identity = ?1 AND peer_identity = ?2 AND session_id = ?3"
                ),
                params![my_identity, peer_identity, &id.as_bytes()[..]],
                Some(1),
            )?,
            None => self.run_scan(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM dh_session
                     WHERE my_identity = ?1 AND peer_identity = ?2"
                ),
                params![my_identity, peer_identity],
                Some(2),
            )?,
        };
        if sessions.len() > 1 {
            return Err(StoreError::AmbiguousSession {
                peer_identity: peer_identity.to_owned(),
            });
        }
        Ok(sessions.pop())
    }

    /// Preferred session for the pair: 4DH first, then lowest session id
    pub fn get_best_session(
        &self,
        my_identity: &str,
        peer_identity: &str,
    ) -> Result<Option<DhSession>, StoreError> {
        let mut sessions = self.run_scan(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM dh_session
                 WHERE my_identity = ?1 AND peer_identity = ?2
                 ORDER BY (my_ratchet_4dh_chain_key IS NULL), session_id"
            ),
            params![my_identity, peer_identity],
            Some(1),
        )?;
        Ok(sessions.pop())
    }

    /// Every valid session for the pair, in no particular order
    pub fn get_all_sessions(
        &self,
        my_identity: &str,
        peer_identity: &str,
    ) -> Result<Vec<DhSession>, StoreError> {
        self.run_scan(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM dh_session
                 WHERE my_identity = ?1 AND peer_identity = ?2"
            ),
            params![my_identity, peer_identity],
            None,
        )
    }

    /// Insert or fully replace the row of `session`
    pub fn store_session(&self, session: &DhSession) -> Result<(), StoreError> {
        let record = session.to_record()?;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stored: Option<(Option<i64>, Option<i64>)> = tx
                .query_row(
                    "SELECT my_current_version_4dh, peer_current_version_4dh FROM dh_session
                     WHERE my_identity = ?1 AND peer_identity = ?2 AND session_id = ?3",
                    params![record.my_identity, record.peer_identity, &record.id.as_bytes()[..]],
                    // An unreadable stored version counts as none
                    |row| {
                        Ok((
                            row.get::<_, Option<i64>>(0).ok().flatten(),
                            row.get::<_, Option<i64>>(1).ok().flatten(),
                        ))
                    },
                )
                .optional()?;

            if let Some((stored_local, stored_remote)) = stored {
                let downgrade = |stored: Option<i64>, new: Option<u32>| match (stored, new) {
                    (Some(_), None) => true,
                    (Some(old), Some(new)) => i64::from(new) < old,
                    (None, _) => false,
                };
                if downgrade(stored_local, record.my_current_version_4dh)
                    || downgrade(stored_remote, record.peer_current_version_4dh)
                {
                    warn!(
                        peer = %record.peer_identity,
                        session = %record.id,
                        "Refusing 4DH version downgrade"
                    );
                    return Err(StoreError::VersionDowngrade { session_id: record.id });
                }
            }

            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO dh_session ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    record.my_identity,
                    record.peer_identity,
                    &record.id.as_bytes()[..],
                    record.my_ephemeral_private_key,
                    record.my_ephemeral_public_key,
                    record.my_current_version_4dh,
                    record.peer_current_version_4dh,
                    ratchet_counter(record.my_ratchet_2dh.as_ref()),
                    ratchet_key(record.my_ratchet_2dh.as_ref()),
                    ratchet_counter(record.my_ratchet_4dh.as_ref()),
                    ratchet_key(record.my_ratchet_4dh.as_ref()),
                    ratchet_counter(record.peer_ratchet_2dh.as_ref()),
                    ratchet_key(record.peer_ratchet_2dh.as_ref()),
                    ratchet_counter(record.peer_ratchet_4dh.as_ref()),
                    ratchet_key(record.peer_ratchet_4dh.as_ref()),
                    record.last_outgoing_message_timestamp,
                ],
            )?;
            tx.commit()?;
            debug!(peer = %record.peer_identity, session = %record.id, "Stored session");
            Ok(())
        })
    }

    /// Remove one session; `true` if a row was deleted
    pub fn delete_session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &DhSessionId,
    ) -> Result<bool, StoreError> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM dh_session
                 WHERE my_identity = ?1 AND peer_identity = ?2 AND session_id = ?3",
                params![my_identity, peer_identity, &session_id.as_bytes()[..]],
            )?)
        })?;
        debug!(peer = %peer_identity, session = %session_id, deleted, "Deleted session");
        Ok(deleted > 0)
    }

    /// Remove every session for the pair, returning how many were deleted
    pub fn delete_all_sessions(
        &self,
        my_identity: &str,
        peer_identity: &str,
    ) -> Result<usize, StoreError> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM dh_session WHERE my_identity = ?1 AND peer_identity = ?2",
                params![my_identity, peer_identity],
            )?)
        })?;
        debug!(peer = %peer_identity, deleted, "Deleted all sessions");
        Ok(deleted)
    }

    /// Remove every session for the pair except `keep`.
    ///
    /// With `four_dh_only` only sessions holding a 4DH ratchet are removed.
    pub fn delete_all_sessions_except(
        &self,
        my_identity: &str,
        peer_identity: &str,
        keep: &DhSessionId,
        four_dh_only: bool,
    ) -> Result<usize, StoreError> {
        let sql = if four_dh_only {
            "DELETE FROM dh_session
             WHERE my_identity = ?1 AND peer_identity = ?2 AND session_id != ?3
             AND my_ratchet_4dh_chain_key IS NOT NULL"
        } else {
            "DELETE FROM dh_session
             WHERE my_identity = ?1 AND peer_identity = ?2 AND session_id != ?3"
        };
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(sql, params![my_identity, peer_identity, &keep.as_bytes()[..]])?)
        })?;
        debug!(
            peer = %peer_identity,
            kept = %keep,
            four_dh_only,
            deleted,
            "Deleted superseded sessions"
        );
        Ok(deleted)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use x25519_dalek::{PublicKey, StaticSecret};

    use crate::session::{
        LocalParty, ProtocolVersion, RemoteParty, SessionState, VersionPair,
        SUPPORTED_VERSION_RANGE,
    };

    const ALICE: &str = "ALICE001";
    const BOB: &str = "BOB00001";

    type Reports = Arc<Mutex<Vec<(String, DhSessionId)>>>;

    fn store() -> (SessionStore, Reports) {
        let reports: Reports = Arc::default();
        let sink = Arc::clone(&reports);
        let handler = move |peer: &str, id: &DhSessionId| {
            sink.lock().unwrap().push((peer.to_owned(), *id));
        };
        let db = Arc::new(Database::open_in_memory().unwrap());
        (SessionStore::new(db, Arc::new(handler)), reports)
    }

    fn keys(seed: u8) -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::from([seed; 32]);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    /// Responder-side session with the given id (4DH pair present)
    fn four_dh_session(id: DhSessionId) -> DhSession {
        let (alice_secret, _) = keys(1);
        let (_, bob_public) = keys(2);
        let (peer_ephemeral, _) = keys(3);
        DhSession::new_responder(
            id,
            &PublicKey::from(&peer_ephemeral),
            &SUPPORTED_VERSION_RANGE,
            LocalParty { identity: ALICE, secret: &alice_secret },
            RemoteParty { identity: BOB, public_key: &bob_public },
        )
        .unwrap()
    }

    /// Initiator session (my 2DH ratchet only) restored under a chosen id
    fn two_dh_session(id: DhSessionId) -> DhSession {
        let (alice_secret, _) = keys(1);
        let (_, bob_public) = keys(2);
        let fresh = DhSession::new_initiator(
            LocalParty { identity: ALICE, secret: &alice_secret },
            RemoteParty { identity: BOB, public_key: &bob_public },
        );
        let mut record = fresh.to_record().unwrap();
        record.id = id;
        DhSession::restore(&record).unwrap()
    }

    fn id(first: u8, second: u8) -> DhSessionId {
        let mut bytes = [0u8; 16];
        bytes[0] = first;
        bytes[1] = second;
        DhSessionId::from_bytes(bytes)
    }

    fn corrupt_all_ratchets(store: &SessionStore, session_id: &DhSessionId) {
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE dh_session SET
                        my_ratchet_2dh_counter = NULL, my_ratchet_2dh_chain_key = NULL,
                        my_ratchet_4dh_counter = NULL, my_ratchet_4dh_chain_key = NULL,
                        peer_ratchet_2dh_counter = NULL, peer_ratchet_2dh_chain_key = NULL,
                        peer_ratchet_4dh_counter = NULL, peer_ratchet_4dh_chain_key = NULL,
                        my_current_version_4dh = NULL, peer_current_version_4dh = NULL
                     WHERE session_id = ?1",
                    [&session_id.as_bytes()[..]],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let (store, reports) = store();
        let mut session = four_dh_session(id(1, 0));
        session.my_ratchet_4dh_mut().unwrap().turn();
        session.record_outgoing_message(42);
        store.store_session(&session).unwrap();

        let loaded = store
            .get_session(ALICE, BOB, Some(session.id()))
            .unwrap()
            .unwrap();
        assert_eq!(loaded, session);
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_session_is_none() {
        let (store, _) = store();
        assert!(store.get_session(ALICE, BOB, Some(&id(9, 9))).unwrap().is_none());
        assert!(store.get_session(ALICE, BOB, None).unwrap().is_none());
        assert!(store.get_best_session(ALICE, BOB).unwrap().is_none());
        assert!(store.get_all_sessions(ALICE, BOB).unwrap().is_empty());
    }

    #[test]
    fn test_get_session_without_id() {
        let (store, _) = store();
        store.store_session(&four_dh_session(id(1, 0))).unwrap();
        assert!(store.get_session(ALICE, BOB, None).unwrap().is_some());

        store.store_session(&four_dh_session(id(2, 0))).unwrap();
        assert!(matches!(
            store.get_session(ALICE, BOB, None),
            Err(StoreError::AmbiguousSession { .. })
        ));
    }

    #[test]
    fn test_sessions_scoped_by_identity_pair() {
        let (store, _) = store();
        store.store_session(&four_dh_session(id(1, 0))).unwrap();
        assert!(store.get_all_sessions(BOB, ALICE).unwrap().is_empty());
        assert!(store.get_best_session(ALICE, "CAROL001").unwrap().is_none());
    }

    #[test]
    fn test_best_session_prefers_4dh_over_lower_id() {
        let two_dh = two_dh_session(id(0x01, 0x00));
        let four_dh = four_dh_session(id(0x00, 0xFF));

        for order in [[&two_dh, &four_dh], [&four_dh, &two_dh]] {
            let (store, _) = store();
            for s in order {
                store.store_session(s).unwrap();
            }
            let best = store.get_best_session(ALICE, BOB).unwrap().unwrap();
            assert_eq!(best.id(), four_dh.id());
        }
    }

    #[test]
    fn test_best_session_tie_breaks_on_lowest_id() {
        let (store, _) = store();
        store.store_session(&four_dh_session(id(0x02, 0x00))).unwrap();
        store.store_session(&four_dh_session(id(0x01, 0xFF))).unwrap();
        store.store_session(&two_dh_session(id(0x00, 0x01))).unwrap();

        let best = store.get_best_session(ALICE, BOB).unwrap().unwrap();
        assert_eq!(best.id(), &id(0x01, 0xFF));
    }

    #[test]
    fn test_best_session_skips_corrupt_row() {
        let (store, reports) = store();
        store.store_session(&four_dh_session(id(0x01, 0))).unwrap();
        store.store_session(&four_dh_session(id(0x02, 0))).unwrap();
        // Keeps its 4DH chain key, so it still sorts first
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE dh_session SET my_ephemeral_public_key = x'00' WHERE session_id = ?1",
                    [&id(0x01, 0).as_bytes()[..]],
                )?;
                Ok(())
            })
            .unwrap();

        let best = store.get_best_session(ALICE, BOB).unwrap().unwrap();
        assert_eq!(best.id(), &id(0x02, 0));
        assert_eq!(*reports.lock().unwrap(), vec![(BOB.to_owned(), id(0x01, 0))]);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (store, _) = store();
        let session = four_dh_session(id(1, 0));
        store.store_session(&session).unwrap();
        store.store_session(&session).unwrap();
        assert_eq!(store.get_all_sessions(ALICE, BOB).unwrap(), vec![session]);
    }

    #[test]
    fn test_upsert_replaces_whole_row() {
        let (store, _) = store();
        let mut session = four_dh_session(id(1, 0));
        store.store_session(&session).unwrap();

        session.discard_peer_ratchet_2dh();
        session.peer_ratchet_4dh_mut().unwrap().turn_until(7).unwrap();
        store.store_session(&session).unwrap();

        let loaded = store.get_session(ALICE, BOB, Some(session.id())).unwrap().unwrap();
        assert!(loaded.peer_ratchet_2dh().is_none());
        assert_eq!(loaded.peer_ratchet_4dh().unwrap().counter(), 7);
        assert_eq!(loaded.state(), SessionState::FourDhEstablished { awaiting_first_4dh: false });
    }

    #[test]
    fn test_store_rejects_version_downgrade() {
        let (store, _) = store();
        let session = four_dh_session(id(1, 0));
        store.store_session(&session).unwrap();

        // An older copy of the session at a lower negotiated version
        let mut record = session.to_record().unwrap();
        record.my_current_version_4dh = Some(ProtocolVersion::V1_0.number());
        let stale = DhSession::restore(&record).unwrap();
        assert!(matches!(
            store.store_session(&stale),
            Err(StoreError::VersionDowngrade { .. })
        ));

        let loaded = store.get_session(ALICE, BOB, Some(session.id())).unwrap().unwrap();
        assert_eq!(
            loaded.current_4dh_versions(),
            Some(VersionPair::both(ProtocolVersion::V1_2))
        );
    }

    #[test]
    fn test_store_overwrites_row_with_unreadable_versions() {
        let (store, reports) = store();
        let session = four_dh_session(id(1, 0));
        store.store_session(&session).unwrap();
        store
            .db
            .with_conn(|conn| {
                conn.execute("UPDATE dh_session SET my_current_version_4dh = 'bogus'", [])?;
                Ok(())
            })
            .unwrap();
        assert!(store.get_session(ALICE, BOB, Some(session.id())).unwrap().is_none());
        assert_eq!(reports.lock().unwrap().len(), 1);

        store.store_session(&session).unwrap();

        let loaded = store.get_session(ALICE, BOB, Some(session.id())).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(
            loaded.current_4dh_versions(),
            Some(VersionPair::both(ProtocolVersion::V1_2))
        );
        assert_eq!(reports.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_session() {
        let (store, _) = store();
        let session = four_dh_session(id(1, 0));
        store.store_session(&session).unwrap();
        assert!(store.delete_session(ALICE, BOB, session.id()).unwrap());
        assert!(!store.delete_session(ALICE, BOB, session.id()).unwrap());
    }

    #[test]
    fn test_delete_all_sessions() {
        let (store, _) = store();
        store.store_session(&four_dh_session(id(1, 0))).unwrap();
        store.store_session(&two_dh_session(id(2, 0))).unwrap();
        assert_eq!(store.delete_all_sessions(ALICE, BOB).unwrap(), 2);
        assert!(store.get_all_sessions(ALICE, BOB).unwrap().is_empty());
    }

    #[test]
    fn test_delete_all_except_four_dh_only() {
        let (store, _) = store();
        let a = two_dh_session(id(0xA, 0));
        let b = four_dh_session(id(0xB, 0));
        let c = two_dh_session(id(0xC, 0));
        for s in [&a, &b, &c] {
            store.store_session(s).unwrap();
        }

        assert_eq!(store.delete_all_sessions_except(ALICE, BOB, a.id(), true).unwrap(), 1);
        let mut remaining: Vec<DhSessionId> = store
            .get_all_sessions(ALICE, BOB)
            .unwrap()
            .iter()
            .map(|s| *s.id())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![*a.id(), *c.id()]);
    }

    #[test]
    fn test_delete_all_except_keeps_only_one() {
        let (store, _) = store();
        let a = two_dh_session(id(0xA, 0));
        let b = four_dh_session(id(0xB, 0));
        let c = two_dh_session(id(0xC, 0));
        for s in [&a, &b, &c] {
            store.store_session(s).unwrap();
        }

        assert_eq!(store.delete_all_sessions_except(ALICE, BOB, b.id(), false).unwrap(), 2);
        assert_eq!(store.get_all_sessions(ALICE, BOB).unwrap(), vec![b]);
    }

    #[test]
    fn test_corrupt_row_isolated_in_listing() {
        let (store, reports) = store();
        for n in 1..=3 {
            store.store_session(&four_dh_session(id(n, 0))).unwrap();
        }
        corrupt_all_ratchets(&store, &id(2, 0));

        let sessions = store.get_all_sessions(ALICE, BOB).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.id() != &id(2, 0)));
        assert_eq!(*reports.lock().unwrap(), vec![(BOB.to_owned(), id(2, 0))]);
    }

    #[test]
    fn test_wrong_column_type_is_illegal_not_fatal() {
        let (store, reports) = store();
        store.store_session(&four_dh_session(id(1, 0))).unwrap();
        store.store_session(&four_dh_session(id(2, 0))).unwrap();
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE dh_session SET my_ratchet_4dh_counter = 'seven' WHERE session_id = ?1",
                    [&id(1, 0).as_bytes()[..]],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_all_sessions(ALICE, BOB).unwrap().len(), 1);
        assert!(store.get_session(ALICE, BOB, Some(&id(1, 0))).unwrap().is_none());
        assert_eq!(reports.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_malformed_session_id_is_skipped() {
        let (store, reports) = store();
        store.store_session(&four_dh_session(id(1, 0))).unwrap();
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE dh_session SET session_id = x'0102' WHERE session_id = ?1",
                    [&id(1, 0).as_bytes()[..]],
                )?;
                Ok(())
            })
            .unwrap();

        assert!(store.get_all_sessions(ALICE, BOB).unwrap().is_empty());
        assert!(reports.lock().unwrap().is_empty());
    }
}
