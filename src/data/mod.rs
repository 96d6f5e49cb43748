//! Data Module
//!
//! Stores variable-length values addressed by a `u64` id. The id is what
//! the index keeps per key.

mod sectored;
mod streaming;

pub use sectored::SectoredDataLookup;
pub use streaming::StreamingDataLookup;

use std::path::Path;

use crate::error::Result;

/// Id → bytes storage backing an index
pub trait DataLookup: Send + Sync {
    /// Short description of the on-disk layout, e.g. `sectored:512`.
    /// A map refuses to reopen files written under a different one.
    fn layout(&self) -> String;

    /// Create or open the backing files under `dir`
    fn init(&self, dir: &Path) -> Result<()>;

    /// Load persisted allocation state
    fn load(&self) -> Result<()>;

    fn read(&self, id: u64) -> Result<Vec<u8>>;

    /// Store `data`, releasing `old` first. Returns the new id.
    fn write(&self, old: Option<u64>, data: &[u8]) -> Result<u64>;

    fn remove(&self, id: u64) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn save(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}
