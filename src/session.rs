//! DH session state for one (my identity, peer identity, session id) triple.
//!
//! A session holds up to four independent ratchets:
//!
//! ```text
//!                 2DH (static-static + static-ephemeral)   4DH (all four DH results)
//! my ratchet      my_ratchet_2dh                           my_ratchet_4dh
//! peer ratchet    peer_ratchet_2dh                         peer_ratchet_4dh
//! ```
//!
//! Lifecycle:
//! - Initiator: `new_initiator` (my 2DH only) → `process_accept` (4DH pair,
//!   ephemeral private key wiped, my 2DH dropped)
//! - Responder: `new_responder` (peer 2DH + 4DH pair) → `discard_peer_ratchet_2dh`
//!   once the first 4DH message arrives
//!
//! Sessions never persist themselves: after turning a ratchet the caller must
//! write the session back through `SessionStore::store_session`.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{
    derive_initial_chain_key, EphemeralPrivateKey, KEY_SIZE, KE_SALT_2DH_PREFIX,
    KE_SALT_4DH_PREFIX,
};
use crate::ratchet::{KdfRatchet, RatchetError};

/// Length of a session id in bytes
pub const SESSION_ID_SIZE: usize = 16;

/// Versions this implementation can speak
pub const SUPPORTED_VERSION_RANGE: VersionRange =
    VersionRange::new(ProtocolVersion::V1_0, ProtocolVersion::V1_2);

/// Random 16-byte session identifier, ordered byte-wise
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DhSessionId([u8; SESSION_ID_SIZE]);

impl DhSessionId {
    /// Mint a fresh random id
    #[must_use]
    pub fn random() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// `None` unless `bytes` is exactly 16 bytes long
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for DhSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for DhSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhSessionId({self})")
    }
}

/// Forward security protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl ProtocolVersion {
    /// Wire number (major in the high byte, minor in the low byte)
    #[must_use]
    pub const fn number(self) -> u32 {
        match self {
            ProtocolVersion::V1_0 => 0x0100,
            ProtocolVersion::V1_1 => 0x0101,
            ProtocolVersion::V1_2 => 0x0102,
        }
    }

    #[must_use]
    pub const fn from_number(number: u32) -> Option<Self> {
        match number {
            0x0100 => Some(ProtocolVersion::V1_0),
            0x0101 => Some(ProtocolVersion::V1_1),
            0x0102 => Some(ProtocolVersion::V1_2),
            _ => None,
        }
    }
}

/// Inclusive range of protocol versions offered by one side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

impl VersionRange {
    #[must_use]
    pub const fn new(min: ProtocolVersion, max: ProtocolVersion) -> Self {
        Self { min, max }
    }

    /// Highest version contained in both ranges
    pub fn negotiate(&self, other: &VersionRange) -> Result<ProtocolVersion, SessionError> {
        let highest = self.max.min(other.max);
        let lowest = self.min.max(other.min);
        if highest < lowest {
            return Err(SessionError::NoCommonVersion);
        }
        Ok(highest)
    }
}

/// Negotiated 4DH versions (local = mine, remote = peer's)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPair {
    pub local: ProtocolVersion,
    pub remote: ProtocolVersion,
}

impl VersionPair {
    #[must_use]
    pub const fn both(version: ProtocolVersion) -> Self {
        Self { local: version, remote: version }
    }
}

/// Security level of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Init sent, waiting for the peer's accept (my 2DH ratchet only)
    Handshaking,
    /// Only 2DH ratchets, no 4DH pair
    TwoDhOnly,
    /// 4DH ratchet pair present
    FourDhEstablished {
        /// The peer 2DH ratchet is still kept for in-flight 2DH messages
        awaiting_first_4dh: bool,
    },
}

/// Error types for in-memory session operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Missing ephemeral private key")]
    MissingEphemeralPrivateKey,
    #[error("No common protocol version")]
    NoCommonVersion,
    #[error("Protocol version downgrade from {from:?} to {to:?}")]
    VersionDowngrade { from: VersionPair, to: VersionPair },
    #[error("4DH versions require an established 4DH ratchet pair")]
    VersionsWithoutFourDh,
    #[error("Ratchet counter {0} does not fit the storage format")]
    CounterOverflow(u64),
    #[error("Ratchet error: {0}")]
    Ratchet(#[from] RatchetError),
}

/// A stored session that does not describe a valid `DhSession`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal state of session {session_id} with {peer_identity}: {reason}")]
pub struct IllegalSessionStateError {
    pub peer_identity: String,
    pub session_id: DhSessionId,
    pub reason: String,
}

/// Stored form of a ratchet
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RatchetRecord {
    pub counter: i64,
    pub chain_key: Vec<u8>,
}

impl fmt::Debug for RatchetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetRecord")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Storage-fidelity form of a session: every nullable column is an `Option`
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionRecord {
    #[zeroize(skip)]
    pub id: DhSessionId,
    pub my_identity: String,
    pub peer_identity: String,
    pub my_ephemeral_private_key: Option<Vec<u8>>,
    pub my_ephemeral_public_key: Vec<u8>,
    pub my_current_version_4dh: Option<u32>,
    pub peer_current_version_4dh: Option<u32>,
    pub my_ratchet_2dh: Option<RatchetRecord>,
    pub my_ratchet_4dh: Option<RatchetRecord>,
    pub peer_ratchet_2dh: Option<RatchetRecord>,
    pub peer_ratchet_4dh: Option<RatchetRecord>,
    pub last_outgoing_message_timestamp: i64,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("my_identity", &self.my_identity)
            .field("peer_identity", &self.peer_identity)
            .finish_non_exhaustive()
    }
}

/// Our side of a key agreement
#[derive(Clone, Copy)]
pub struct LocalParty<'a> {
    pub identity: &'a str,
    pub secret: &'a StaticSecret,
}

/// The peer's side of a key agreement
#[derive(Clone, Copy)]
pub struct RemoteParty<'a> {
    pub identity: &'a str,
    pub public_key: &'a PublicKey,
}

/// ECDH key exchange and ratcheting session for forward security
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhSession {
    id: DhSessionId,
    my_identity: String,
    peer_identity: String,
    /// Wiped once the 4DH ratchets have been derived
    my_ephemeral_private_key: Option<EphemeralPrivateKey>,
    my_ephemeral_public_key: [u8; KEY_SIZE],
    current_4dh_versions: Option<VersionPair>,
    my_ratchet_2dh: Option<KdfRatchet>,
    my_ratchet_4dh: Option<KdfRatchet>,
    peer_ratchet_2dh: Option<KdfRatchet>,
    peer_ratchet_4dh: Option<KdfRatchet>,
    last_outgoing_message_timestamp: i64,
}

fn concat_dh(parts: &[&[u8; KEY_SIZE]]) -> Zeroizing<Vec<u8>> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(parts.len() * KEY_SIZE));
    for part in parts {
        ikm.extend_from_slice(&part[..]);
    }
    ikm
}

fn four_dh_ratchets(
    my_identity: &str,
    peer_identity: &str,
    ikm: &[u8],
) -> (KdfRatchet, KdfRatchet) {
    let mine = derive_initial_chain_key(KE_SALT_4DH_PREFIX, my_identity, ikm);
    let peer = derive_initial_chain_key(KE_SALT_4DH_PREFIX, peer_identity, ikm);
    (KdfRatchet::from_chain_key(1, mine), KdfRatchet::from_chain_key(1, peer))
}

impl DhSession {
    /// Start a new session as the initiator, with a fresh id and ephemeral key.
    ///
    /// Only my 2DH ratchet exists until the peer's accept is processed.
    #[must_use]
    pub fn new_initiator(me: LocalParty<'_>, peer: RemoteParty<'_>) -> Self {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let ss = me.secret.diffie_hellman(peer.public_key);
        let se = ephemeral.diffie_hellman(peer.public_key);
        let ikm = concat_dh(&[ss.as_bytes(), se.as_bytes()]);
        let my_k0 = derive_initial_chain_key(KE_SALT_2DH_PREFIX, me.identity, &ikm);

        let private_bytes = Zeroizing::new(ephemeral.to_bytes());

        Self {
            id: DhSessionId::random(),
            my_identity: me.identity.to_owned(),
            peer_identity: peer.identity.to_owned(),
            my_ephemeral_private_key: Some(EphemeralPrivateKey::new(&private_bytes)),
            my_ephemeral_public_key: *ephemeral_public.as_bytes(),
            current_4dh_versions: None,
            my_ratchet_2dh: Some(KdfRatchet::from_chain_key(1, my_k0)),
            my_ratchet_4dh: None,
            peer_ratchet_2dh: None,
            peer_ratchet_4dh: None,
            last_outgoing_message_timestamp: 0,
        }
    }

    /// Answer a peer's init as the responder.
    ///
    /// Derives the peer 2DH ratchet (for messages the initiator sends before it
    /// sees our accept) and the full 4DH pair. Our ephemeral private key is
    /// wiped before returning.
    pub fn new_responder(
        id: DhSessionId,
        peer_ephemeral_public_key: &PublicKey,
        peer_versions: &VersionRange,
        me: LocalParty<'_>,
        peer: RemoteParty<'_>,
    ) -> Result<Self, SessionError> {
        let version = SUPPORTED_VERSION_RANGE.negotiate(peer_versions)?;

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let ss = me.secret.diffie_hellman(peer.public_key);
        let se = me.secret.diffie_hellman(peer_ephemeral_public_key);
        let ikm_2dh = concat_dh(&[ss.as_bytes(), se.as_bytes()]);
        let peer_k0 = derive_initial_chain_key(KE_SALT_2DH_PREFIX, peer.identity, &ikm_2dh);

        let es = ephemeral.diffie_hellman(peer.public_key);
        let ee = ephemeral.diffie_hellman(peer_ephemeral_public_key);
        let ikm_4dh = concat_dh(&[ss.as_bytes(), se.as_bytes(), es.as_bytes(), ee.as_bytes()]);
        let (mine, theirs) = four_dh_ratchets(me.identity, peer.identity, &ikm_4dh);

        Ok(Self {
            id,
            my_identity: me.identity.to_owned(),
            peer_identity: peer.identity.to_owned(),
            my_ephemeral_private_key: None,
            my_ephemeral_public_key: *ephemeral_public.as_bytes(),
            current_4dh_versions: Some(VersionPair::both(version)),
            my_ratchet_2dh: None,
            my_ratchet_4dh: Some(mine),
            peer_ratchet_2dh: Some(KdfRatchet::from_chain_key(1, peer_k0)),
            peer_ratchet_4dh: Some(theirs),
            last_outgoing_message_timestamp: 0,
        })
    }

    /// Process the peer's accept and upgrade this initiator session to 4DH.
    ///
    /// The ephemeral private key is wiped and my 2DH ratchet dropped. The peer
    /// 2DH ratchet is untouched (an initiator never has one).
    pub fn process_accept(
        &mut self,
        peer_ephemeral_public_key: &PublicKey,
        accepted_versions: &VersionRange,
        my_secret: &StaticSecret,
        peer_public_key: &PublicKey,
    ) -> Result<(), SessionError> {
        if self.my_ephemeral_private_key.is_none() {
            return Err(SessionError::MissingEphemeralPrivateKey);
        }
        let version = SUPPORTED_VERSION_RANGE.negotiate(accepted_versions)?;
        let Some(private_key) = self.my_ephemeral_private_key.take() else {
            return Err(SessionError::MissingEphemeralPrivateKey);
        };
        let secret_bytes = Zeroizing::new(*private_key.as_bytes());
        drop(private_key);
        let ephemeral = StaticSecret::from(*secret_bytes);
        drop(secret_bytes);

        let ss = my_secret.diffie_hellman(peer_public_key);
        let se = ephemeral.diffie_hellman(peer_public_key);
        let es = my_secret.diffie_hellman(peer_ephemeral_public_key);
        let ee = ephemeral.diffie_hellman(peer_ephemeral_public_key);
        let ikm = concat_dh(&[ss.as_bytes(), se.as_bytes(), es.as_bytes(), ee.as_bytes()]);
        let (mine, theirs) = four_dh_ratchets(&self.my_identity, &self.peer_identity, &ikm);

        self.my_ratchet_4dh = Some(mine);
        self.peer_ratchet_4dh = Some(theirs);
        self.my_ratchet_2dh = None;
        self.current_4dh_versions = Some(VersionPair::both(version));
        Ok(())
    }

    /// Drop the peer 2DH ratchet after the first 4DH message from the peer.
    ///
    /// No-op without a 4DH pair: the 2DH ratchet is then the only way to read
    /// the peer's messages.
    pub fn discard_peer_ratchet_2dh(&mut self) {
        if self.peer_ratchet_4dh.is_some() {
            self.peer_ratchet_2dh = None;
        }
    }

    /// Rebuild a session from its stored form
    pub fn restore(record: &SessionRecord) -> Result<Self, IllegalSessionStateError> {
        let illegal = |reason: String| IllegalSessionStateError {
            peer_identity: record.peer_identity.clone(),
            session_id: record.id,
            reason,
        };

        let my_ephemeral_public_key: [u8; KEY_SIZE] = record
            .my_ephemeral_public_key
            .as_slice()
            .try_into()
            .map_err(|_| {
                illegal(format!(
                    "ephemeral public key has {} bytes",
                    record.my_ephemeral_public_key.len()
                ))
            })?;

        let my_ephemeral_private_key = record
            .my_ephemeral_private_key
            .as_deref()
            .map(EphemeralPrivateKey::from_slice)
            .transpose()
            .map_err(|e| illegal(format!("ephemeral private key: {e}")))?;

        let my_ratchet_2dh = restore_ratchet("my 2DH", record.my_ratchet_2dh.as_ref()).map_err(illegal)?;
        let my_ratchet_4dh = restore_ratchet("my 4DH", record.my_ratchet_4dh.as_ref()).map_err(illegal)?;
        let peer_ratchet_2dh =
            restore_ratchet("peer 2DH", record.peer_ratchet_2dh.as_ref()).map_err(illegal)?;
        let peer_ratchet_4dh =
            restore_ratchet("peer 4DH", record.peer_ratchet_4dh.as_ref()).map_err(illegal)?;

        if my_ratchet_2dh.is_none()
            && my_ratchet_4dh.is_none()
            && peer_ratchet_2dh.is_none()
            && peer_ratchet_4dh.is_none()
        {
            return Err(illegal("no ratchets".to_owned()));
        }
        if my_ratchet_4dh.is_some() != peer_ratchet_4dh.is_some() {
            return Err(illegal("incomplete 4DH ratchet pair".to_owned()));
        }

        let current_4dh_versions = match (record.my_current_version_4dh, record.peer_current_version_4dh) {
            (None, None) => None,
            (Some(local), Some(remote)) => {
                let local = ProtocolVersion::from_number(local)
                    .ok_or_else(|| illegal(format!("unknown local version {local:#06x}")))?;
                let remote = ProtocolVersion::from_number(remote)
                    .ok_or_else(|| illegal(format!("unknown remote version {remote:#06x}")))?;
                Some(VersionPair { local, remote })
            }
            _ => return Err(illegal("incomplete 4DH version pair".to_owned())),
        };
        if current_4dh_versions.is_some() && my_ratchet_4dh.is_none() {
            return Err(illegal("4DH versions without 4DH ratchets".to_owned()));
        }

        Ok(Self {
            id: record.id,
            my_identity: record.my_identity.clone(),
            peer_identity: record.peer_identity.clone(),
            my_ephemeral_private_key,
            my_ephemeral_public_key,
            current_4dh_versions,
            my_ratchet_2dh,
            my_ratchet_4dh,
            peer_ratchet_2dh,
            peer_ratchet_4dh,
            last_outgoing_message_timestamp: record.last_outgoing_message_timestamp,
        })
    }

    /// Stored form of this session
    pub fn to_record(&self) -> Result<SessionRecord, SessionError> {
        Ok(SessionRecord {
            id: self.id,
            my_identity: self.my_identity.clone(),
            peer_identity: self.peer_identity.clone(),
            my_ephemeral_private_key: self
                .my_ephemeral_private_key
                .as_ref()
                .map(|k| k.as_bytes().to_vec()),
            my_ephemeral_public_key: self.my_ephemeral_public_key.to_vec(),
            my_current_version_4dh: self.current_4dh_versions.map(|v| v.local.number()),
            peer_current_version_4dh: self.current_4dh_versions.map(|v| v.remote.number()),
            my_ratchet_2dh: ratchet_record(self.my_ratchet_2dh.as_ref())?,
            my_ratchet_4dh: ratchet_record(self.my_ratchet_4dh.as_ref())?,
            peer_ratchet_2dh: ratchet_record(self.peer_ratchet_2dh.as_ref())?,
            peer_ratchet_4dh: ratchet_record(self.peer_ratchet_4dh.as_ref())?,
            last_outgoing_message_timestamp: self.last_outgoing_message_timestamp,
        })
    }

    #[must_use]
    pub fn id(&self) -> &DhSessionId {
        &self.id
    }

    #[must_use]
    pub fn my_identity(&self) -> &str {
        &self.my_identity
    }

    #[must_use]
    pub fn peer_identity(&self) -> &str {
        &self.peer_identity
    }

    #[must_use]
    pub fn my_ephemeral_public_key(&self) -> &[u8; KEY_SIZE] {
        &self.my_ephemeral_public_key
    }

    #[must_use]
    pub fn my_ephemeral_private_key(&self) -> Option<&EphemeralPrivateKey> {
        self.my_ephemeral_private_key.as_ref()
    }

    #[must_use]
    pub fn current_4dh_versions(&self) -> Option<VersionPair> {
        self.current_4dh_versions
    }

    /// Move the negotiated versions forward; either side moving back is an error
    pub fn set_current_4dh_versions(&mut self, versions: VersionPair) -> Result<(), SessionError> {
        if self.my_ratchet_4dh.is_none() {
            return Err(SessionError::VersionsWithoutFourDh);
        }
        if let Some(current) = self.current_4dh_versions {
            if versions.local < current.local || versions.remote < current.remote {
                return Err(SessionError::VersionDowngrade { from: current, to: versions });
            }
        }
        self.current_4dh_versions = Some(versions);
        Ok(())
    }

    #[must_use]
    pub fn my_ratchet_2dh(&self) -> Option<&KdfRatchet> {
        self.my_ratchet_2dh.as_ref()
    }

    pub fn my_ratchet_2dh_mut(&mut self) -> Option<&mut KdfRatchet> {
        self.my_ratchet_2dh.as_mut()
    }

    #[must_use]
    pub fn my_ratchet_4dh(&self) -> Option<&KdfRatchet> {
        self.my_ratchet_4dh.as_ref()
    }

    pub fn my_ratchet_4dh_mut(&mut self) -> Option<&mut KdfRatchet> {
        self.my_ratchet_4dh.as_mut()
    }

    #[must_use]
    pub fn peer_ratchet_2dh(&self) -> Option<&KdfRatchet> {
        self.peer_ratchet_2dh.as_ref()
    }

    pub fn peer_ratchet_2dh_mut(&mut self) -> Option<&mut KdfRatchet> {
        self.peer_ratchet_2dh.as_mut()
    }

    #[must_use]
    pub fn peer_ratchet_4dh(&self) -> Option<&KdfRatchet> {
        self.peer_ratchet_4dh.as_ref()
    }

    pub fn peer_ratchet_4dh_mut(&mut self) -> Option<&mut KdfRatchet> {
        self.peer_ratchet_4dh.as_mut()
    }

    #[must_use]
    pub fn last_outgoing_message_timestamp(&self) -> i64 {
        self.last_outgoing_message_timestamp
    }

    pub fn record_outgoing_message(&mut self, timestamp_millis: i64) {
        self.last_outgoing_message_timestamp = timestamp_millis;
    }

    /// Security level derived from which ratchets are present
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.my_ratchet_4dh.is_some() && self.peer_ratchet_4dh.is_some() {
            SessionState::FourDhEstablished {
                awaiting_first_4dh: self.peer_ratchet_2dh.is_some(),
            }
        } else if self.peer_ratchet_2dh.is_some() {
            SessionState::TwoDhOnly
        } else {
            SessionState::Handshaking
        }
    }
}

impl fmt::Display for DhSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.id, self.state())
    }
}

fn restore_ratchet(name: &str, record: Option<&RatchetRecord>) -> Result<Option<KdfRatchet>, String> {
    let Some(record) = record else {
        return Ok(None);
    };
    let counter = u64::try_from(record.counter)
        .map_err(|_| format!("{name} ratchet counter {} is negative", record.counter))?;
    KdfRatchet::new(counter, &record.chain_key)
        .map(Some)
        .map_err(|e| format!("{name} ratchet: {e}"))
}

fn ratchet_record(ratchet: Option<&KdfRatchet>) -> Result<Option<RatchetRecord>, SessionError> {
    ratchet
        .map(|r| {
            let counter =
                i64::try_from(r.counter()).map_err(|_| SessionError::CounterOverflow(r.counter()))?;
            Ok(RatchetRecord {
                counter,
                chain_key: r.current_chain_key().as_bytes().to_vec(),
            })
        })
        .transpose()
}

// ============================================================
// TESTS
// ============================================================
