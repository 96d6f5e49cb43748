//! Disk-resident radix tree index.
//!
//! ## File Format (`tree`)
//! ```text
//! ┌──────────────────────┬──────────────────────┬─────┐
//! │ page 0 (root, mmap)  │ page 1               │ ... │
//! │ fan_out × pointer    │ fan_out × pointer    │     │
//! └──────────────────────┴──────────────────────┴─────┘
//! ```
//!
//! Each level consumes `bytes_per_node` bytes of the key hash (big-endian).
//! Levels of one or two bytes are a single flat page of `256^bytes_per_node`
//! slots. Wider levels would need pages of 2^24 or 2^32 slots, so they are
//! stored as a chain of 256-slot pages, one per hash byte.
//!
//! Slots hold little-endian pointers of `pointer_bytes`: 0 means empty,
//! inner pages store `child_page + 1`, the leaf page stores `value + 1`.
//!
//! `offset` holds the next free page as a bincode `u64` (default 1).

use std::fs::{self, File, OpenOptions};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::IndexLookup;
use crate::error::{DbError, IoContext, Result};
use crate::hash::KeyHasher;
use crate::util::{read_exact_at, read_uint_le, write_all_at, write_uint_le, write_zeros_at};

const TREE_FILE: &str = "tree";
const OFFSET_FILE: &str = "offset";

// =============================================================================
// Geometry
// =============================================================================

/// Widest level stored as one flat page
const MAX_FLAT_BYTES: usize = 2;

/// Shape of the tree for a given hash length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub hash_length: usize,
    pub pointer_bytes: usize,
    pub bytes_per_node: usize,
    /// Levels from root to leaf
    pub total_depth: usize,
    /// Hash bytes consumed by one page
    pub page_bytes: usize,
    /// Pages walked from root to leaf
    pub steps: usize,
    /// Slots per page
    pub fan_out: u64,
    /// Bytes per page
    pub node_size: u64,
}

impl Geometry {
    pub fn new(hash_length: usize, pointer_bytes: usize, bytes_per_node: usize) -> Result<Self> {
        check_widths(pointer_bytes, bytes_per_node)?;
        if hash_length == 0 || hash_length % bytes_per_node != 0 {
            return Err(DbError::InvalidConfig(format!(
                "hash length {} is not a positive multiple of {} bytes per node",
                hash_length, bytes_per_node
            )));
        }
        let page_bytes = if bytes_per_node <= MAX_FLAT_BYTES {
            bytes_per_node
        } else {
            1
        };
        let fan_out = 1u64 << (8 * page_bytes);
        Ok(Self {
            hash_length,
            pointer_bytes,
            bytes_per_node,
            total_depth: hash_length / bytes_per_node,
            page_bytes,
            steps: hash_length / page_bytes,
            fan_out,
            node_size: fan_out * pointer_bytes as u64,
        })
    }

    /// Largest raw pointer a slot can hold
    pub fn max_pointer(&self) -> u64 {
        if self.pointer_bytes == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.pointer_bytes)) - 1
        }
    }

    /// Slot selected by `hash` on the page at `step`
    fn slot(&self, hash: &[u8], step: usize) -> u64 {
        hash[step * self.page_bytes..(step + 1) * self.page_bytes]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64)
    }
}

fn check_widths(pointer_bytes: usize, bytes_per_node: usize) -> Result<()> {
    if !(1..=8).contains(&pointer_bytes) {
        return Err(DbError::InvalidConfig(format!(
            "pointer byte count must be in range 1-8 (given: {})",
            pointer_bytes
        )));
    }
    if !(1..=4).contains(&bytes_per_node) {
        return Err(DbError::InvalidConfig(format!(
            "bytes per node must be in range 1-4 (given: {})",
            bytes_per_node
        )));
    }
    Ok(())
}

// =============================================================================
// State
// =============================================================================

struct Binding<K: ?Sized> {
    hasher: Arc<dyn KeyHasher<K>>,
    dir: PathBuf,
    geometry: Geometry,
}

enum Phase<K: ?Sized> {
    Uninitialized,
    Initialized(Binding<K>),
    Active(Binding<K>, ActiveTree),
    Closed,
}

/// Open tree file with its mapped root
struct ActiveTree {
    tree_path: PathBuf,
    offset_path: PathBuf,
    file: File,
    root: MmapMut,
    next_sector: u64,
    dirty: bool,
}

impl ActiveTree {
    fn open(dir: &Path, geometry: &Geometry) -> Result<Self> {
        let tree_path = dir.join(TREE_FILE);
        let offset_path = dir.join(OFFSET_FILE);

        let next_sector = match fs::read(&offset_path) {
            Ok(raw) => {
                let next: u64 = bincode::deserialize(&raw)?;
                if next == 0 {
                    warn!(path = %offset_path.display(), "sector counter was zero, resetting to 1");
                    1
                } else {
                    next
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(e).at("read sector counter", &offset_path),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&tree_path)
            .at("open tree index", &tree_path)?;
        let len = file.metadata().at("stat tree index", &tree_path)?.len();
        if len < geometry.node_size {
            file.set_len(geometry.node_size)
                .at("size tree index root", &tree_path)?;
        }
        let root = map_root(&file, geometry, &tree_path)?;

        debug!(
            path = %tree_path.display(),
            next_sector,
            node_size = geometry.node_size,
            "tree index loaded"
        );

        Ok(Self {
            tree_path,
            offset_path,
            file,
            root,
            next_sector,
            dirty: false,
        })
    }

    fn pointer_offset(g: &Geometry, sector: u64, slot: u64) -> u64 {
        sector * g.node_size + slot * g.pointer_bytes as u64
    }

    fn read_ptr(&self, g: &Geometry, sector: u64, slot: u64) -> Result<u64> {
        let width = g.pointer_bytes;
        if sector == 0 {
            let at = (slot as usize) * width;
            return Ok(read_uint_le(&self.root[at..at + width], width));
        }
        let mut buf = [0u8; 8];
        read_exact_at(
            &self.file,
            &mut buf[..width],
            Self::pointer_offset(g, sector, slot),
        )
        .at("read index pointer", &self.tree_path)?;
        Ok(read_uint_le(&buf[..width], width))
    }

    fn write_ptr(&mut self, g: &Geometry, sector: u64, slot: u64, value: u64) -> Result<()> {
        let width = g.pointer_bytes;
        self.dirty = true;
        if sector == 0 {
            let at = (slot as usize) * width;
            write_uint_le(&mut self.root[at..at + width], width, value);
            return Ok(());
        }
        let mut buf = [0u8; 8];
        write_uint_le(&mut buf[..width], width, value);
        write_all_at(
            &self.file,
            &buf[..width],
            Self::pointer_offset(g, sector, slot),
        )
        .at("write index pointer", &self.tree_path)
    }

    /// Walk to the leaf. Returns `(sector, slot, raw pointer)` of the leaf
    /// slot, or `None` when an inner level is missing.
    fn find(&self, g: &Geometry, hash: &[u8]) -> Result<Option<(u64, u64, u64)>> {
        let mut sector = 0u64;
        for step in 0..g.steps {
            let slot = g.slot(hash, step);
            let raw = self.read_ptr(g, sector, slot)?;
            if step + 1 == g.steps {
                return Ok(Some((sector, slot, raw)));
            }
            if raw == 0 {
                return Ok(None);
            }
            sector = raw - 1;
        }
        Ok(None)
    }

    fn lookup(&self, g: &Geometry, hash: &[u8]) -> Result<Option<u64>> {
        Ok(self
            .find(g, hash)?
            .and_then(|(_, _, raw)| raw.checked_sub(1)))
    }

    /// Store `value` at the leaf for `hash`, allocating inner nodes on the way
    fn store(&mut self, g: &Geometry, hash: &[u8], value: u64) -> Result<()> {
        let encoded = value
            .checked_add(1)
            .filter(|&v| v <= g.max_pointer())
            .ok_or_else(|| {
                DbError::InvalidArgument(format!(
                    "value {} does not fit in {} pointer bytes",
                    value, g.pointer_bytes
                ))
            })?;

        let mut sector = 0u64;
        for step in 0..g.steps - 1 {
            let slot = g.slot(hash, step);
            let raw = self.read_ptr(g, sector, slot)?;
            sector = if raw == 0 {
                let child = self.allocate(g)?;
                self.write_ptr(g, sector, slot, child + 1)?;
                child
            } else {
                raw - 1
            };
        }
        let leaf_slot = g.slot(hash, g.steps - 1);
        self.write_ptr(g, sector, leaf_slot, encoded)
    }

    /// Hand out the next page. Pages past EOF come from extending the file,
    /// pages left behind by an unsaved counter are zeroed in place.
    fn allocate(&mut self, g: &Geometry) -> Result<u64> {
        let sector = self.next_sector;
        if sector + 1 > g.max_pointer() {
            return Err(DbError::InvalidArgument(format!(
                "tree index is full: page {} does not fit in {} pointer bytes",
                sector, g.pointer_bytes
            )));
        }
        let start = sector * g.node_size;
        let end = start + g.node_size;
        let len = self
            .file
            .metadata()
            .at("stat tree index", &self.tree_path)?
            .len();
        if len <= start {
            self.file
                .set_len(end)
                .at("grow tree index", &self.tree_path)?;
        } else {
            write_zeros_at(&self.file, start, g.node_size)
                .at("zero index page", &self.tree_path)?;
            if len < end {
                self.file
                    .set_len(end)
                    .at("grow tree index", &self.tree_path)?;
            }
        }
        self.next_sector += 1;
        self.dirty = true;
        Ok(sector)
    }

    fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let raw = bincode::serialize(&self.next_sector)?;
        fs::write(&self.offset_path, raw).at("write sector counter", &self.offset_path)?;
        self.root.flush().at("flush index root", &self.tree_path)?;
        self.file.sync_data().at("sync tree index", &self.tree_path)?;
        self.dirty = false;
        Ok(())
    }

    fn clear(&mut self, g: &Geometry) -> Result<()> {
        self.file.set_len(0).at("truncate tree index", &self.tree_path)?;
        self.file
            .set_len(g.node_size)
            .at("size tree index root", &self.tree_path)?;
        self.root = map_root(&self.file, g, &self.tree_path)?;
        self.next_sector = 1;
        self.dirty = true;
        Ok(())
    }
}

fn map_root(file: &File, geometry: &Geometry, path: &Path) -> Result<MmapMut> {
    let len = usize::try_from(geometry.node_size).map_err(|_| {
        DbError::InvalidConfig(format!(
            "node size {} exceeds the address space",
            geometry.node_size
        ))
    })?;
    // SAFETY: the index owns `file` for the mapping's lifetime and only one
    // process opens an index directory at a time.
    let mapped = unsafe { MmapOptions::new().len(len).map_mut(file) };
    mapped.at("map index root", path)
}

// =============================================================================
// TreeIndexLookup
// =============================================================================

/// Radix tree from key hash to `u64`
///
/// ## Concurrency:
/// - One reader/writer lock over the whole index
/// - `get`/`contains`/`run_if_contains` share it, everything else is exclusive
pub struct TreeIndexLookup<K: ?Sized> {
    pointer_bytes: usize,
    bytes_per_node: usize,
    state: RwLock<Phase<K>>,
}

impl<K: ?Sized> TreeIndexLookup<K> {
    pub fn new(pointer_bytes: usize, bytes_per_node: usize) -> Result<Self> {
        check_widths(pointer_bytes, bytes_per_node)?;
        Ok(Self {
            pointer_bytes,
            bytes_per_node,
            state: RwLock::new(Phase::Uninitialized),
        })
    }

    pub fn pointer_bytes(&self) -> usize {
        self.pointer_bytes
    }

    pub fn bytes_per_node(&self) -> usize {
        self.bytes_per_node
    }

    /// Geometry once a hasher is bound
    pub fn geometry(&self) -> Option<Geometry> {
        match &*self.state.read() {
            Phase::Initialized(b) | Phase::Active(b, _) => Some(b.geometry),
            _ => None,
        }
    }

    /// Levels from root to leaf once a hasher is bound
    pub fn total_depth(&self) -> Option<usize> {
        self.geometry().map(|g| g.total_depth)
    }

    /// Next sector the index will hand out
    pub fn next_sector(&self) -> Result<u64> {
        let state = self.state.read();
        let (_, tree) = active(&*state)?;
        Ok(tree.next_sector)
    }
}

fn active<K: ?Sized>(phase: &Phase<K>) -> Result<(&Binding<K>, &ActiveTree)> {
    match phase {
        Phase::Active(binding, tree) => Ok((binding, tree)),
        Phase::Closed => Err(DbError::AlreadyClosed("tree index")),
        _ => Err(DbError::NotInitialized("tree index")),
    }
}

fn active_mut<K: ?Sized>(phase: &mut Phase<K>) -> Result<(&Binding<K>, &mut ActiveTree)> {
    match phase {
        Phase::Active(binding, tree) => Ok((&*binding, tree)),
        Phase::Closed => Err(DbError::AlreadyClosed("tree index")),
        _ => Err(DbError::NotInitialized("tree index")),
    }
}

impl<K: ?Sized> Binding<K> {
    fn hash(&self, key: &K) -> Result<Vec<u8>> {
        let hash = self.hasher.hash(key);
        if hash.len() != self.geometry.hash_length {
            return Err(DbError::InvalidArgument(format!(
                "hasher produced {} bytes, index expects {}",
                hash.len(),
                self.geometry.hash_length
            )));
        }
        Ok(hash)
    }
}

impl<K: ?Sized> IndexLookup<K> for TreeIndexLookup<K> {
    fn layout(&self) -> String {
        format!("tree:{}:{}", self.pointer_bytes, self.bytes_per_node)
    }

    fn init(&self, hasher: Arc<dyn KeyHasher<K>>, dir: &Path) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            Phase::Uninitialized => {}
            Phase::Closed => return Err(DbError::AlreadyClosed("tree index")),
            _ => return Err(DbError::AlreadyInitialized("tree index")),
        }

        let geometry = Geometry::new(hasher.hash_length(), self.pointer_bytes, self.bytes_per_node)?;
        fs::create_dir_all(dir).at("create index directory", dir)?;
        let tree_path = dir.join(TREE_FILE);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&tree_path)
            .at("create tree index", &tree_path)?;

        info!(
            dir = %dir.display(),
            total_depth = geometry.total_depth,
            node_size = geometry.node_size,
            "tree index initialized"
        );
        *state = Phase::Initialized(Binding {
            hasher,
            dir: dir.to_path_buf(),
            geometry,
        });
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let mut state = self.state.write();
        let binding = match mem::replace(&mut *state, Phase::Uninitialized) {
            Phase::Initialized(binding) => binding,
            other => {
                let err = match &other {
                    Phase::Uninitialized => DbError::NotInitialized("tree index"),
                    Phase::Closed => DbError::AlreadyClosed("tree index"),
                    _ => DbError::AlreadyInitialized("tree index"),
                };
                *state = other;
                return Err(err);
            }
        };
        match ActiveTree::open(&binding.dir, &binding.geometry) {
            Ok(tree) => {
                *state = Phase::Active(binding, tree);
                Ok(())
            }
            Err(e) => {
                *state = Phase::Initialized(binding);
                Err(e)
            }
        }
    }

    fn get(&self, key: &K) -> Result<Option<u64>> {
        let state = self.state.read();
        let (binding, tree) = active(&*state)?;
        tree.lookup(&binding.geometry, &binding.hash(key)?)
    }

    fn set(&self, key: &K, value: u64) -> Result<()> {
        let mut state = self.state.write();
        let (binding, tree) = active_mut(&mut *state)?;
        tree.store(&binding.geometry, &binding.hash(key)?, value)
    }

    fn remove(&self, key: &K) -> Result<Option<u64>> {
        let mut state = self.state.write();
        let (binding, tree) = active_mut(&mut *state)?;
        let g = &binding.geometry;
        match tree.find(g, &binding.hash(key)?)? {
            Some((sector, slot, raw)) if raw != 0 => {
                tree.write_ptr(g, sector, slot, 0)?;
                Ok(Some(raw - 1))
            }
            _ => Ok(None),
        }
    }

    fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn change<F>(&self, key: &K, f: F) -> Result<u64>
    where
        F: FnOnce(Option<u64>) -> Result<u64>,
    {
        let mut state = self.state.write();
        let (binding, tree) = active_mut(&mut *state)?;
        let hash = binding.hash(key)?;
        let current = tree.lookup(&binding.geometry, &hash)?;
        let next = f(current)?;
        tree.store(&binding.geometry, &hash, next)?;
        Ok(next)
    }

    fn change_if_contains<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(u64) -> Result<u64>,
    {
        let mut state = self.state.write();
        let (binding, tree) = active_mut(&mut *state)?;
        let hash = binding.hash(key)?;
        let Some(current) = tree.lookup(&binding.geometry, &hash)? else {
            return Ok(false);
        };
        let next = f(current)?;
        tree.store(&binding.geometry, &hash, next)?;
        Ok(true)
    }

    fn run_if_contains<T, F>(&self, key: &K, f: F) -> Result<Option<T>>
    where
        F: FnOnce(u64) -> Result<T>,
    {
        let state = self.state.read();
        let (binding, tree) = active(&*state)?;
        match tree.lookup(&binding.geometry, &binding.hash(key)?)? {
            Some(value) => f(value).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        let (_, tree) = active_mut(&mut *state)?;
        tree.save()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match &mut *state {
            Phase::Active(_, tree) => tree.save()?,
            Phase::Closed => return Err(DbError::AlreadyClosed("tree index")),
            _ => {}
        }
        // Dropping the active tree unmaps the root and closes the file
        *state = Phase::Closed;
        debug!("tree index closed");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let (binding, tree) = active_mut(&mut *state)?;
        tree.clear(&binding.geometry)?;
        info!(dir = %binding.dir.display(), "tree index cleared");
        Ok(())
    }
}
