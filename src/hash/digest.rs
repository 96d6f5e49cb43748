//! SHA-256 key hasher with configurable output length.

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{DbError, Result};

use super::KeyHasher;

/// Hashes any byte-like key with SHA-256, keeping the first `len` bytes.
#[derive(Debug, Clone, Copy)]
pub struct DigestHasher {
    len: usize,
}

impl DigestHasher {
    /// Full 32-byte digest length
    pub const MAX_LENGTH: usize = 32;

    pub fn new(len: usize) -> Result<Self> {
        if len == 0 || len > Self::MAX_LENGTH {
            return Err(DbError::InvalidConfig(format!(
                "digest length must be in range 1-{} (given: {})",
                Self::MAX_LENGTH,
                len
            )));
        }
        Ok(Self { len })
    }

    /// Hasher producing `config.hash_length` bytes
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.hash_length)
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self { len: 16 }
    }
}

impl<K: AsRef<[u8]> + ?Sized> KeyHasher<K> for DigestHasher {
    fn hash(&self, key: &K) -> Vec<u8> {
        let digest = Sha256::digest(key.as_ref());
        digest[..self.len].to_vec()
    }

    fn hash_length(&self) -> usize {
        self.len
    }
}
