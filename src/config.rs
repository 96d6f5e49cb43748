//! Configuration for PorkDB
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DbError, Result};

/// Main configuration for a PorkDB instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {hex(b0)}/{hex(rest)}.pdbe   (tree backend)
    ///     ├── data.pdba                     (archive backend)
    ///     ├── index/{tree,offset}           (DbMap index)
    ///     └── data/{data,sectors}           (DbMap values)
    pub data_dir: PathBuf,

    /// Which file manager stores values for a `Store`
    pub backend: Backend,

    /// Handle/lock budget before idle entries are garbage collected
    pub max_open_files: usize,

    /// Fixed value size; `Some` selects constant-length files
    pub value_size: Option<usize>,

    /// Suffix of files written by the tree backend
    pub entry_extension: String,

    /// Suffix of the archive file (`data.{suffix}`)
    pub archive_suffix: String,

    /// Compression of members inside the archive
    pub archive_compression: Compression,

    /// Compression applied by the facades before values reach storage
    pub compression: Compression,

    /// How long `shutdown` may wait for in-flight operations (None = forever)
    pub shutdown_timeout: Option<Duration>,

    // -------------------------------------------------------------------------
    // Hashing / Index Configuration
    // -------------------------------------------------------------------------
    /// Digest length in bytes for `DigestHasher::from_config`
    pub hash_length: usize,

    /// Width of each pointer slot in the tree index (1-8)
    pub pointer_bytes: usize,

    /// Hash bytes consumed per tree level (1-4)
    pub bytes_per_node: usize,

    /// Slot bits of the hash table index, `2^table_bits` slots (1-32)
    pub table_bits: u32,

    /// Sector size of the DbMap data file
    pub data_sector_size: usize,
}

/// Storage backend used by `Store`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// One file per sub-hash in a two-level directory tree
    Tree,

    /// All entries as members of a single archive file
    Archive,
}

/// Value compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,

    /// Deflate with the given level (0-9)
    Deflate(u32),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./porkdb_data"),
            backend: Backend::Tree,
            max_open_files: 128,
            value_size: None,
            entry_extension: ".pdbe".to_string(),
            archive_suffix: "pdba".to_string(),
            archive_compression: Compression::None,
            compression: Compression::None,
            shutdown_timeout: None,
            hash_length: 16,
            pointer_bytes: 5,
            bytes_per_node: 1,
            table_bits: 16,
            data_sector_size: 512,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            return Err(DbError::InvalidConfig(
                "max_open_files must be at least 1".to_string(),
            ));
        }
        if let Some(0) = self.value_size {
            return Err(DbError::InvalidConfig(
                "constant value size must be at least 1 byte".to_string(),
            ));
        }
        if self.hash_length < 2 || self.hash_length > 32 {
            return Err(DbError::InvalidConfig(format!(
                "hash length must be in range 2-32 (given: {})",
                self.hash_length
            )));
        }
        if !(1..=8).contains(&self.pointer_bytes) {
            return Err(DbError::InvalidConfig(format!(
                "pointer byte count must be in range 1-8 (given: {})",
                self.pointer_bytes
            )));
        }
        if !(1..=4).contains(&self.bytes_per_node) {
            return Err(DbError::InvalidConfig(format!(
                "bytes per node must be in range 1-4 (given: {})",
                self.bytes_per_node
            )));
        }
        if !(1..=32).contains(&self.table_bits) {
            return Err(DbError::InvalidConfig(format!(
                "table bits must be in range 1-32 (given: {})",
                self.table_bits
            )));
        }
        if self.data_sector_size < 64 {
            return Err(DbError::InvalidConfig(format!(
                "data sector size must be at least 64 bytes (given: {})",
                self.data_sector_size
            )));
        }
        if self.archive_suffix.is_empty() {
            return Err(DbError::InvalidConfig(
                "archive suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the storage backend
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the open handle budget
    pub fn max_open_files(mut self, count: usize) -> Self {
        self.config.max_open_files = count;
        self
    }

    /// Store every value with exactly `size` bytes
    pub fn value_size(mut self, size: usize) -> Self {
        self.config.value_size = Some(size);
        self
    }

    /// Set the suffix of tree backend files
    pub fn entry_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.entry_extension = ext.into();
        self
    }

    /// Set the archive file suffix
    pub fn archive_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.archive_suffix = suffix.into();
        self
    }

    /// Set the archive member compression
    pub fn archive_compression(mut self, compression: Compression) -> Self {
        self.config.archive_compression = compression;
        self
    }

    /// Set the value compression used by the facades
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Bound the time `shutdown` waits for in-flight operations
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = Some(timeout);
        self
    }

    /// Set the default hasher's digest length
    pub fn hash_length(mut self, len: usize) -> Self {
        self.config.hash_length = len;
        self
    }

    /// Set the tree index pointer width
    pub fn pointer_bytes(mut self, bytes: usize) -> Self {
        self.config.pointer_bytes = bytes;
        self
    }

    /// Set the hash bytes consumed per tree level
    pub fn bytes_per_node(mut self, bytes: usize) -> Self {
        self.config.bytes_per_node = bytes;
        self
    }

    /// Set the hash table index size as a power of two
    pub fn table_bits(mut self, bits: u32) -> Self {
        self.config.table_bits = bits;
        self
    }

    /// Set the DbMap data sector size
    pub fn data_sector_size(mut self, size: usize) -> Self {
        self.config.data_sector_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
