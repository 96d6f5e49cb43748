//! DbMap: a typed-key map over a pluggable index and data store.
//!
//! ## Directory Layout (defaults)
//! ```text
//! {data_dir}/
//!   ├── map.meta        size + layouts (bincode)
//!   ├── index/tree      radix tree, root mapped
//!   ├── index/offset    next free index page
//!   ├── data/data       chained value sectors
//!   └── data/sectors    used-sector bitmap
//! ```
//!
//! `open_with` swaps in any `IndexLookup`/`DataLookup` pair, e.g. a
//! `HashTableIndexLookup` over a `StreamingDataLookup`; their files land
//! under the same `index/` and `data/` directories.
//!
//! ## Write Path
//! ```text
//! put(key, value)
//!   → compress value
//!   → index.change(key):  old id ─► data.write(old, bytes) ─► new id
//!   → size += 1 if the key was new
//! ```

use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec;
use crate::config::{Compression, Config};
use crate::data::{DataLookup, SectoredDataLookup};
use crate::error::{DbError, IoContext, Result};
use crate::hash::KeyHasher;
use crate::index::{IndexLookup, TreeIndexLookup};

const META_FILE: &str = "map.meta";

/// Persisted map header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MapMeta {
    size: u64,
    hash_length: u32,
    index_layout: String,
    data_layout: String,
}

impl MapMeta {
    fn same_layout(&self, other: &MapMeta) -> bool {
        self.hash_length == other.hash_length
            && self.index_layout == other.index_layout
            && self.data_layout == other.data_layout
    }
}

/// Key → bytes map backed by an index and a data store
///
/// Defaults to a `TreeIndexLookup` over a `SectoredDataLookup`.
pub struct DbMap<K: ?Sized, I = TreeIndexLookup<K>, D = SectoredDataLookup> {
    dir: PathBuf,
    compression: Compression,
    index: I,
    data: D,
    meta: Mutex<MapMeta>,
    size: AtomicU64,
    dirty: AtomicBool,
    closed: AtomicBool,
    _key: PhantomData<fn(&K)>,
}

impl<K: ?Sized> DbMap<K> {
    /// Open or create a map under `config.data_dir` with the default stores
    ///
    /// Reopening with a different hash length, pointer width, node width or
    /// sector size fails with `InvalidConfig`.
    pub fn open(config: &Config, hasher: Arc<dyn KeyHasher<K>>) -> Result<Self> {
        let index = TreeIndexLookup::new(config.pointer_bytes, config.bytes_per_node)?;
        let data = SectoredDataLookup::new(config.data_sector_size)?;
        Self::open_with(config, hasher, index, data)
    }
}

impl<K: ?Sized, I, D> DbMap<K, I, D>
where
    I: IndexLookup<K>,
    D: DataLookup,
{
    /// Open or create a map over fresh, uninitialized stores
    ///
    /// Steps:
    /// 1. Check `map.meta` against the hasher and both store layouts
    /// 2. Init and load the index under `index/`
    /// 3. Init and load the data store under `data/`
    pub fn open_with(
        config: &Config,
        hasher: Arc<dyn KeyHasher<K>>,
        index: I,
        data: D,
    ) -> Result<Self> {
        config.validate()?;
        let dir = config.data_dir.clone();
        fs::create_dir_all(&dir).at("create map directory", &dir)?;

        let wanted = MapMeta {
            size: 0,
            hash_length: hasher.hash_length() as u32,
            index_layout: index.layout(),
            data_layout: data.layout(),
        };
        let meta_path = dir.join(META_FILE);
        let (meta, fresh) = match fs::read(&meta_path) {
            Ok(raw) => {
                let stored: MapMeta = bincode::deserialize(&raw)?;
                if !stored.same_layout(&wanted) {
                    return Err(DbError::InvalidConfig(format!(
                        "map at {} was created with {:?}, opened with {:?}",
                        dir.display(),
                        stored,
                        wanted
                    )));
                }
                (stored, false)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (wanted, true),
            Err(e) => return Err(e).at("read map meta", &meta_path),
        };

        index.init(hasher, &dir.join("index"))?;
        index.load()?;

        data.init(&dir.join("data"))?;
        data.load()?;

        let size = meta.size;
        let map = Self {
            dir,
            compression: config.compression,
            index,
            data,
            meta: Mutex::new(meta),
            size: AtomicU64::new(size),
            dirty: AtomicBool::new(fresh),
            closed: AtomicBool::new(false),
            _key: PhantomData,
        };
        if fresh {
            map.write_meta()?;
        }
        info!(dir = %map.dir.display(), size, fresh, "map opened");
        Ok(map)
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, key: &K) -> Result<Option<Vec<u8>>> {
        self.index
            .run_if_contains(key, |id| self.unpack(self.data.read(id)?))
    }

    /// Insert or replace a value, returning the previous one
    pub fn put(&self, key: &K, value: &[u8]) -> Result<Option<Vec<u8>>> {
        let packed = codec::compress(self.compression, value)?;
        let mut old = None;
        self.index.change(key, |id| {
            if let Some(id) = id {
                old = Some(self.unpack(self.data.read(id)?)?);
            }
            self.data.write(id, &packed)
        })?;
        if old.is_none() {
            self.size.fetch_add(1, Ordering::SeqCst);
        }
        self.dirty.store(true, Ordering::SeqCst);
        Ok(old)
    }

    /// Insert or replace a value without reading the previous one back
    pub fn insert(&self, key: &K, value: &[u8]) -> Result<()> {
        let packed = codec::compress(self.compression, value)?;
        let mut fresh = false;
        self.index.change(key, |id| {
            fresh = id.is_none();
            self.data.write(id, &packed)
        })?;
        if fresh {
            self.size.fetch_add(1, Ordering::SeqCst);
        }
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Insert every pair, skipping previous-value reads
    pub fn insert_all<'a, V, It>(&self, entries: It) -> Result<()>
    where
        K: 'a,
        V: AsRef<[u8]> + 'a,
        It: IntoIterator<Item = (&'a K, V)>,
    {
        for (key, value) in entries {
            self.insert(key, value.as_ref())?;
        }
        Ok(())
    }

    /// Remove a key, returning its value
    pub fn remove(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let Some(id) = self.index.remove(key)? else {
            return Ok(None);
        };
        let old = self.unpack(self.data.read(id)?)?;
        self.data.remove(id)?;
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(Some(old))
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        self.index.contains(key)
    }

    /// Number of entries
    pub fn len(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and persist the empty state
    pub fn clear(&self) -> Result<()> {
        self.index.clear()?;
        self.data.clear()?;
        self.size.store(0, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
        self.save()
    }

    /// Persist size, index and data allocation state
    pub fn save(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.write_meta() {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        self.index.save()?;
        self.data.save()
    }

    /// Save and close. A second call fails with `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("map"));
        }
        self.save()?;
        self.index.close()?;
        self.data.close()?;
        debug!(dir = %self.dir.display(), "map closed");
        Ok(())
    }

    fn unpack(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(stored),
            other => codec::decompress(other, &stored),
        }
    }

    fn write_meta(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.size = self.len();
        let raw = bincode::serialize(&*meta)?;
        let path = self.dir.join(META_FILE);
        fs::write(&path, raw).at("write map meta", &path)
    }
}
