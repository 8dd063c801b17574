//! One-way KDF ratchet producing per-message keys.
//!
//! ```text
//! ChainKey(n) ──kdf-aek──► MessageKey(n)
//!     │
//!   kdf-ck
//!     ▼
//! ChainKey(n+1)   (ChainKey(n) wiped)
//! ```
//!
//! Restoring a ratchet from a stored `(counter, chain key)` pair only resumes
//! counting forward: keys of earlier counters cannot be regenerated.

use crate::crypto::{ChainKey, MessageKey};

/// Upper bound for a single `turn_until` fast-forward
pub const MAX_COUNTER_INCREMENT: u64 = 25_000;

/// Error types for ratchet operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RatchetError {
    #[error("Invalid ratchet state: chain key must be 32 bytes, got {0}")]
    InvalidState(usize),
    #[error("Cannot rotate ratchet backwards (counter {current}, target {target})")]
    RotationBackwards { current: u64, target: u64 },
    #[error("Ratchet increment of {0} turns exceeds the limit")]
    TooManyTurns(u64),
}

/// Forward-only hash ratchet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfRatchet {
    counter: u64,
    current_chain_key: ChainKey,
}

impl KdfRatchet {
    /// Restore a ratchet from persisted state
    pub fn new(counter: u64, chain_key: &[u8]) -> Result<Self, RatchetError> {
        let current_chain_key =
            ChainKey::from_slice(chain_key).map_err(|_| RatchetError::InvalidState(chain_key.len()))?;
        Ok(Self { counter, current_chain_key })
    }

    pub(crate) fn from_chain_key(counter: u64, current_chain_key: ChainKey) -> Self {
        Self { counter, current_chain_key }
    }

    /// Number of derivations performed so far
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn current_chain_key(&self) -> &ChainKey {
        &self.current_chain_key
    }

    /// Key for the message at the current counter
    #[must_use]
    pub fn current_encryption_key(&self) -> MessageKey {
        self.current_chain_key.encryption_key()
    }

    /// Derive the message key for the current counter and advance the chain.
    ///
    /// Returns `(message_key, next_chain_key)`. The previous chain key is
    /// zeroized when it is replaced.
    pub fn turn(&mut self) -> (MessageKey, ChainKey) {
        let message_key = self.current_chain_key.encryption_key();
        let next = self.current_chain_key.next();
        self.current_chain_key = next.clone();
        self.counter += 1;
        (message_key, next)
    }

    /// Turn until `counter == target`, returning the number of turns taken
    pub fn turn_until(&mut self, target: u64) -> Result<u64, RatchetError> {
        if target < self.counter {
            return Err(RatchetError::RotationBackwards {
                current: self.counter,
                target,
            });
        }
        let turns = target - self.counter;
        if turns > MAX_COUNTER_INCREMENT {
            return Err(RatchetError::TooManyTurns(turns));
        }
        for _ in 0..turns {
            self.turn();
        }
        Ok(turns)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ratchet() -> KdfRatchet {
        KdfRatchet::new(1, &[0x42; 32]).unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_key_length() {
        assert_eq!(KdfRatchet::new(1, &[0u8; 16]), Err(RatchetError::InvalidState(16)));
        assert_eq!(KdfRatchet::new(1, &[]), Err(RatchetError::InvalidState(0)));
    }

    #[test]
    fn test_counter_increments_once_per_turn() {
        let mut r = ratchet();
        let start = r.counter();
        for i in 1..=50u64 {
            r.turn();
            assert_eq!(r.counter(), start + i);
        }
    }

    #[test]
    fn test_turn_returns_current_encryption_key() {
        let mut r = ratchet();
        let expected = r.current_encryption_key();
        let (mk, ck) = r.turn();
        assert_eq!(mk, expected);
        assert_eq!(&ck, r.current_chain_key());
    }

    #[test]
    fn test_message_keys_are_distinct() {
        let mut r = ratchet();
        let keys: HashSet<[u8; 32]> = (0..200).map(|_| *r.turn().0.as_bytes()).collect();
        assert_eq!(keys.len(), 200);
    }

    #[test]
    fn test_restore_resumes_forward() {
        let mut original = ratchet();
        original.turn();
        original.turn();

        let mut restored =
            KdfRatchet::new(original.counter(), original.current_chain_key().as_bytes()).unwrap();
        assert_eq!(restored, original);

        let (a, _) = original.turn();
        let (b, _) = restored.turn();
        assert_eq!(a, b);
    }

    #[test]
    fn test_turn_until() {
        let mut r = ratchet();
        assert_eq!(r.turn_until(1), Ok(0));
        assert_eq!(r.turn_until(10), Ok(9));
        assert_eq!(r.counter(), 10);

        let mut stepped = ratchet();
        for _ in 0..9 {
            stepped.turn();
        }
        assert_eq!(stepped, r);
    }

    #[test]
    fn test_turn_until_rejects_backwards() {
        let mut r = KdfRatchet::new(5, &[1u8; 32]).unwrap();
        assert_eq!(
            r.turn_until(4),
            Err(RatchetError::RotationBackwards { current: 5, target: 4 })
        );
        assert_eq!(r.counter(), 5);
    }

    #[test]
    fn test_turn_until_rejects_large_increment() {
        let mut r = ratchet();
        let target = 1 + MAX_COUNTER_INCREMENT + 1;
        assert_eq!(
            r.turn_until(target),
            Err(RatchetError::TooManyTurns(MAX_COUNTER_INCREMENT + 1))
        );
        assert_eq!(r.counter(), 1, "failed fast-forward must not move the ratchet");
    }
}
