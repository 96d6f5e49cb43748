//! # PorkDB
//!
//! An embedded, file-backed key-value store with:
//! - Pluggable key hashing with a fast in-memory hash-of-hash
//! - Two storage backends: one file per sub-hash, or a single archive
//! - A bounded, reference-counted pool of open file handles
//! - A disk-resident radix tree index with a memory-mapped root, or a
//!   bucketed hash table index, over chained or contiguous value sectors
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │        Store<K>          │        │        DbMap<K>          │
//! │   (hasher + backend)     │        │  (hasher + index + data) │
//! └────────────┬─────────────┘        └────────────┬─────────────┘
//!              │                                   │
//!              ▼                          ┌────────┴────────┐
//! ┌──────────────────────────┐            ▼                 ▼
//! │      FileManager         │   ┌─────────────────┐ ┌─────────────────┐
//! │  Tree    │   Archive     │   │ TreeIndexLookup │ │ SectoredData    │
//! └────┬─────┴──────┬────────┘   │ (radix, mmap)   │ │ (chained)       │
//!      │            │            │ HashTableIndex  │ │ StreamingData   │
//!      ▼            ▼            │ (buckets)       │ │ (contiguous)    │
//! ┌──────────┐ ┌──────────┐      └─────────────────┘ └─────────────────┘
//! │ OpenFile │ │ Archive  │
//! └──────────┘ └──────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod hash;
pub mod file;
pub mod index;
pub mod data;
pub mod map;
pub mod store;

mod bitmap;
mod util;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{Backend, Compression, Config};
pub use error::{DbError, Result};
pub use file::{ArchiveFileManager, FileManager, TreeFileManager};
pub use hash::{DigestHasher, HashedKey, KeyHasher, PrimitiveKeyHasher};
pub use data::{DataLookup, SectoredDataLookup, StreamingDataLookup};
pub use index::{HashTableIndexLookup, IndexLookup, TreeIndexLookup};
pub use map::DbMap;
pub use store::Store;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of PorkDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
