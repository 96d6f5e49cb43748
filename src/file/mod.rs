//! File Module
//!
//! Storage backends that map a hashed key to bytes on disk.
//!
//! ## Responsibilities
//! - Route a key hash to its backing file (tree) or archive member (archive)
//! - Bound the number of open handles and garbage-collect idle ones
//! - Drain in-flight operations on shutdown
//!
//! ## Backends
//! ```text
//!                 ┌──────────────────┐
//!                 │   FileManager    │
//!                 └────────┬─────────┘
//!          ┌───────────────┴───────────────┐
//!          ▼                               ▼
//! ┌──────────────────┐            ┌──────────────────┐
//! │ TreeFileManager  │            │ArchiveFileManager│
//! │ handle arena     │            │ CountingLock map │
//! └────────┬─────────┘            └────────┬─────────┘
//!          ▼                               ▼
//! ┌──────────────────┐            ┌──────────────────┐
//! │ OpenFile         │            │ Archive          │
//! │ constant/sectored│            │ (single file)    │
//! └──────────────────┘            └──────────────────┘
//! ```

mod archive;
mod constant;
mod open_file;
mod sectored;
mod tree;

pub use archive::{Archive, ArchiveFileManager, CountingLock, LockTicket};
pub use constant::ConstantLengthFile;
pub use open_file::OpenFile;
pub use sectored::{SectoredFile, SECTOR_BYTES};
pub use tree::TreeFileManager;

use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::hash::HashedKey;

/// Visitor called with `(full_hash, value)` for every stored entry
pub type EntryVisitor<'a> = dyn FnMut(&[u8], Bytes) -> Result<()> + 'a;

/// Storage backend contract
///
/// All methods take `&self`; implementations synchronize internally.
pub trait FileManager: Send + Sync {
    /// Prepare on-disk structures. Calling twice fails with `AlreadyInitialized`.
    fn init(&self) -> Result<()>;

    /// Read the value for a key, `None` if absent
    fn get(&self, key: &HashedKey) -> Result<Option<Vec<u8>>>;

    /// Write the value for a key, creating backing storage as needed
    fn put(&self, key: &HashedKey, value: &[u8]) -> Result<()>;

    /// Remove a key. Returns whether it was present.
    fn remove(&self, key: &HashedKey) -> Result<bool>;

    fn contains(&self, key: &HashedKey) -> Result<bool>;

    /// Visit every stored entry, in no particular order
    fn for_each(&self, visitor: &mut EntryVisitor<'_>) -> Result<()>;

    /// Block until in-flight operations drain, then release all handles
    ///
    /// New operations fail with `AlreadyClosed` once shutdown has begun.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()>;

    /// Whether values may be stored in compressed form
    fn supports_compression(&self) -> bool {
        true
    }
}
