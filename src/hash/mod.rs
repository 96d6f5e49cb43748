//! Hashing Module
//!
//! Turns keys into the fixed-length hashes every storage layer routes on.
//!
//! ## Responsibilities
//! - Pluggable key → hash digest (`KeyHasher`)
//! - Fast 64-bit hash-of-hash for in-memory handle routing
//! - Splitting a hash into sub-hash (routing) and slot (intra-file id)
//!
//! ## Hash Layout
//! ```text
//! ┌──────────────────────────────────────┬────────┐
//! │ sub-hash (hash_length - 1 bytes)     │ slot   │
//! │ byte0 → directory, rest → file name  │ 0..255 │
//! └──────────────────────────────────────┴────────┘
//! ```

mod digest;
mod primitive;

pub use digest::DigestHasher;
pub use primitive::PrimitiveKeyHasher;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::{DbError, Result};

/// Maps a key to a deterministic, fixed-length hash.
pub trait KeyHasher<K: ?Sized>: Send + Sync {
    /// Hash a key. The result is always `hash_length()` bytes long.
    fn hash(&self, key: &K) -> Vec<u8>;

    /// Length of every hash this hasher produces
    fn hash_length(&self) -> usize;

    /// Rebuild the key from its hash, for hashers that are reversible
    fn reconstruct(&self, _hash: &[u8]) -> Option<K>
    where
        K: Sized,
    {
        None
    }
}

/// A full key hash paired with its precomputed hash-of-hash.
///
/// The hash-of-hash covers the sub-hash only, so every key routed to the same
/// backing file also shares one handle-cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedKey {
    hash: Box<[u8]>,
    hash_hash: u64,
}

impl HashedKey {
    /// Wrap a full hash. Hashes shorter than 2 bytes have no sub-hash.
    pub fn new(hash: impl Into<Box<[u8]>>) -> Result<Self> {
        let hash = hash.into();
        if hash.len() < 2 {
            return Err(DbError::InvalidArgument(format!(
                "key hash must be at least 2 bytes (given: {})",
                hash.len()
            )));
        }
        let hash_hash = xxh3_64(&hash[..hash.len() - 1]);
        Ok(Self { hash, hash_hash })
    }

    /// Hash a key with the given hasher
    pub fn of<K: ?Sized>(hasher: &dyn KeyHasher<K>, key: &K) -> Result<Self> {
        Self::new(hasher.hash(key))
    }

    /// The full hash
    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// Everything but the trailing slot byte
    pub fn sub_hash(&self) -> &[u8] {
        &self.hash[..self.hash.len() - 1]
    }

    /// The trailing byte, used as a slot inside the backing file
    pub fn slot(&self) -> u8 {
        self.hash[self.hash.len() - 1]
    }

    /// Fast 64-bit digest of the sub-hash
    pub fn hash_hash(&self) -> u64 {
        self.hash_hash
    }
}
