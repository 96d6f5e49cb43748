//! Store: a typed-key facade over a `FileManager`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::codec;
use crate::config::{Backend, Compression, Config};
use crate::error::{DbError, Result};
use crate::file::{ArchiveFileManager, FileManager, TreeFileManager};
use crate::hash::{HashedKey, KeyHasher};

/// Key → bytes store on the backend chosen by `config.backend`
pub struct Store<K: ?Sized> {
    hasher: Arc<dyn KeyHasher<K>>,
    files: Box<dyn FileManager>,
    compression: Compression,
    shutdown_timeout: Option<Duration>,
}

impl<K: ?Sized> Store<K> {
    pub fn open(config: &Config, hasher: Arc<dyn KeyHasher<K>>) -> Result<Self> {
        config.validate()?;
        if hasher.hash_length() < 2 {
            return Err(DbError::InvalidConfig(format!(
                "file managers need hashes of at least 2 bytes (hasher gives {})",
                hasher.hash_length()
            )));
        }

        let files: Box<dyn FileManager> = match config.backend {
            Backend::Tree => Box::new(TreeFileManager::new(config)),
            Backend::Archive => Box::new(ArchiveFileManager::new(config)),
        };
        files.init()?;

        let mut compression = config.compression;
        if compression != Compression::None {
            if config.value_size.is_some() {
                warn!(
                    ?compression,
                    "values have a constant length, compression is disabled"
                );
                compression = Compression::None;
            } else if !files.supports_compression() {
                warn!(
                    ?compression,
                    "file manager does not support compression, values are stored raw"
                );
                compression = Compression::None;
            }
        }

        info!(
            dir = %config.data_dir.display(),
            backend = ?config.backend,
            ?compression,
            "store opened"
        );

        Ok(Self {
            hasher,
            files,
            compression,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// The backend serving this store
    pub fn file_manager(&self) -> &dyn FileManager {
        self.files.as_ref()
    }

    pub fn get(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let key = self.hashed(key)?;
        match self.files.get(&key)? {
            Some(stored) => Ok(Some(codec::decompress(self.compression, &stored)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &K, value: &[u8]) -> Result<()> {
        let key = self.hashed(key)?;
        let stored = codec::compress(self.compression, value)?;
        self.files.put(&key, &stored)
    }

    /// Returns whether the key was present
    pub fn remove(&self, key: &K) -> Result<bool> {
        let key = self.hashed(key)?;
        self.files.remove(&key)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        let key = self.hashed(key)?;
        self.files.contains(&key)
    }

    /// Visit every `(hash, value)` pair
    pub fn for_each(&self, mut visit: impl FnMut(&[u8], Vec<u8>) -> Result<()>) -> Result<()> {
        let compression = self.compression;
        self.files.for_each(&mut |hash, stored| {
            visit(hash, codec::decompress(compression, &stored)?)
        })
    }

    /// Every stored key, for hashers that can reverse their hash
    pub fn keys(&self) -> Result<Vec<K>>
    where
        K: Sized,
    {
        let mut keys = Vec::new();
        self.files.for_each(&mut |hash, _| {
            let key = self.hasher.reconstruct(hash).ok_or_else(|| {
                DbError::InvalidArgument("key hasher cannot reconstruct keys".to_string())
            })?;
            keys.push(key);
            Ok(())
        })?;
        Ok(keys)
    }

    /// Drain in-flight operations and release all handles
    pub fn shutdown(&self) -> Result<()> {
        self.files.shutdown(self.shutdown_timeout)
    }

    fn hashed(&self, key: &K) -> Result<HashedKey> {
        HashedKey::of(self.hasher.as_ref(), key)
    }
}
