//! Index Module
//!
//! Maps keys to 64-bit pointers (data ids) stored on disk.
//!
//! ## Lifecycle
//! ```text
//! Uninitialized ──init──► Initialized ──load──► Active ──close──► Closed
//!                                                 │ ▲
//!                                                 └─┘ get/set/remove/change/clear/save
//! ```

mod hashtable;
mod tree;

pub use hashtable::HashTableIndexLookup;
pub use tree::{Geometry, TreeIndexLookup};

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::hash::KeyHasher;

/// Key → pointer lookup with read-modify-write helpers
///
/// Values are plain `u64`s; absence is `None`, never an error.
pub trait IndexLookup<K: ?Sized>: Send + Sync {
    /// Short description of the on-disk layout, e.g. `tree:5:1`.
    /// A map refuses to reopen files written under a different one.
    fn layout(&self) -> String;

    /// Bind the hasher and on-disk directory. Fails on a second call.
    fn init(&self, hasher: Arc<dyn KeyHasher<K>>, dir: &Path) -> Result<()>;

    /// Open the on-disk structures and make the index active
    fn load(&self) -> Result<()>;

    fn get(&self, key: &K) -> Result<Option<u64>>;

    fn set(&self, key: &K, value: u64) -> Result<()>;

    /// Remove a key, returning its previous value
    fn remove(&self, key: &K) -> Result<Option<u64>>;

    fn contains(&self, key: &K) -> Result<bool>;

    /// Replace the value with `f(current)` atomically. Returns the new value.
    fn change<F>(&self, key: &K, f: F) -> Result<u64>
    where
        F: FnOnce(Option<u64>) -> Result<u64>;

    /// Like `change`, but only when the key is present. Returns whether `f` ran.
    fn change_if_contains<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(u64) -> Result<u64>;

    /// Run `f` on the current value while no writer can change it
    fn run_if_contains<T, F>(&self, key: &K, f: F) -> Result<Option<T>>
    where
        F: FnOnce(u64) -> Result<T>;

    /// Persist pending changes
    fn save(&self) -> Result<()>;

    /// Save and release resources. Later calls fail with `AlreadyClosed`.
    fn close(&self) -> Result<()>;

    /// Drop every entry
    fn clear(&self) -> Result<()>;
}
