//! Ratchet Storage - Forward secrecy session and nonce persistence
//!
//! This crate keeps the long-lived state of a forward-secure messaging layer:
//! - KDF ratchets deriving one key per message, wiping every used chain key
//! - DH sessions (2DH / 4DH) between two identities, with an explicit state
//! - A durable session store with deterministic best-session selection
//! - A replay-protection nonce store keyed by the local identity
//! - A versioned schema migration chain run once on open
//!
//! ## Architecture
//!
//! ```text
//! Message processor (caller)
//!     ↓ get_best_session / store_session, exists / store
//! SessionStore ──────────────── NonceStore
//!     │  SessionRecord ↔ DhSession    │  HMAC-SHA256(identity, nonce)
//!     └──────────────┬────────────────┘
//!                    ↓
//!             Database (one SQLite connection, migrated on open)
//!                    ↓
//!   dh_session │ nonce_csp │ nonce_d2d      (schema version in user_version)
//! ```
//!
//! Illegal stored sessions are handed to the `SessionErrorHandler` injected at
//! construction; the store keeps serving the remaining rows.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod db;
pub mod migration;
pub mod nonce;
pub mod ratchet;
pub mod session;
pub mod store;

pub use config::{StoreConfig, DEFAULT_BUSY_TIMEOUT};
pub use crypto::{
    derive_key, hash_nonce, ChainKey, CryptoError, EphemeralPrivateKey, MessageKey,
    KDF_PERSONAL, KEY_SIZE,
};
pub use db::{Database, StoreError};
pub use migration::{Migration, MigrationError, CURRENT_SCHEMA_VERSION, MIGRATIONS};
pub use nonce::{IdentityProvider, NonceScope, NonceStore, HASHED_NONCE_LENGTH, NONCE_LENGTH};
pub use ratchet::{KdfRatchet, RatchetError, MAX_COUNTER_INCREMENT};
pub use session::{
    DhSession, DhSessionId, IllegalSessionStateError, LocalParty, ProtocolVersion,
    RatchetRecord, RemoteParty, SessionError, SessionRecord, SessionState, VersionPair,
    VersionRange, SESSION_ID_SIZE, SUPPORTED_VERSION_RANGE,
};
pub use store::{SessionErrorHandler, SessionStore};
