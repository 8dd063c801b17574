//! Key derivation and hashing primitives.
//!
//! - HKDF-SHA256 for the ratchet and handshake KDF
//! - HMAC-SHA256 for identity-keyed nonce hashing
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `ChainKey`, `MessageKey` and `EphemeralPrivateKey`
//!   implement `ZeroizeOnDrop`; replacing a chain key wipes the previous one
//! - **Domain separation**: chain keys and encryption keys are expanded with
//!   distinct salts ("kdf-ck", "kdf-aek"), handshake keys with "ke-2dh-{identity}"
//!   and "ke-4dh-{identity}", all under the personal label `KDF_PERSONAL`
//! - **Redacted `Debug`**: key types never print their bytes

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Length of every symmetric key and X25519 key handled here
pub const KEY_SIZE: usize = 32;

/// Personal label mixed into every KDF expansion
pub const KDF_PERSONAL: &[u8] = b"fs-e2e";

const CHAIN_KEY_SALT: &[u8] = b"kdf-ck";
const ENCRYPTION_KEY_SALT: &[u8] = b"kdf-aek";

pub(crate) const KE_SALT_2DH_PREFIX: &str = "ke-2dh-";
pub(crate) const KE_SALT_4DH_PREFIX: &str = "ke-4dh-";

/// Error types for crypto operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key length: {0}")]
    InvalidKeyLength(usize),
}

/// Ratchet chain key (32 bytes)
/// Automatically zeroized on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; KEY_SIZE]);

impl ChainKey {
    /// Copy `bytes` into a key that is wiped on drop
    #[must_use]
    pub fn new(bytes: &[u8; KEY_SIZE]) -> Self {
        Self(*bytes)
    }

    /// Copy a chain key out of stored key material
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Next chain key in the ratchet
    #[must_use]
    pub(crate) fn next(&self) -> ChainKey {
        ChainKey(derive_key(CHAIN_KEY_SALT, &self.0))
    }

    /// Message encryption key bound to this chain key
    #[must_use]
    pub(crate) fn encryption_key(&self) -> MessageKey {
        MessageKey(derive_key(ENCRYPTION_KEY_SALT, &self.0))
    }
}

impl fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChainKey(..)")
    }
}

/// Per-message symmetric key (32 bytes)
/// Automatically zeroized on drop
#[derive(Clone, PartialEq, Eq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; KEY_SIZE]);

impl MessageKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

/// Local ephemeral X25519 private key, kept only until 4DH is derived
/// Automatically zeroized on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralPrivateKey([u8; KEY_SIZE]);

impl EphemeralPrivateKey {
    /// Copy `bytes` into a key that is wiped on drop
    #[must_use]
    pub fn new(bytes: &[u8; KEY_SIZE]) -> Self {
        Self(*bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EphemeralPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralPrivateKey(..)")
    }
}

/// HKDF-SHA256(salt, ikm) expanded with `KDF_PERSONAL` to 32 bytes
///
/// Expanding a single SHA-256 block cannot fail; a failure here is an
/// invariant violation and aborts.
#[must_use]
pub fn derive_key(salt: &[u8], ikm: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(KDF_PERSONAL, &mut okm)
        .expect("HKDF-SHA256 expand of 32 bytes is infallible");
    okm
}

/// Initial chain key for a handshake stage, salted with the owning identity
#[must_use]
pub(crate) fn derive_initial_chain_key(prefix: &str, identity: &str, ikm: &[u8]) -> ChainKey {
    let salt = format!("{prefix}{identity}");
    ChainKey(derive_key(salt.as_bytes(), ikm))
}

/// HMAC-SHA256 of a raw nonce keyed by the identity string
///
/// Stored instead of the raw nonce so that nonce databases of different
/// identities cannot be correlated.
#[must_use]
pub fn hash_nonce(identity: &str, nonce: &[u8]) -> [u8; KEY_SIZE] {
    // HMAC accepts keys of any length
    let mut mac = <HmacSha256 as Mac>::new_from_slice(identity.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts keys of any length"));
    mac.update(nonce);
    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

// ============================================================
// TESTS
// ============================================================
