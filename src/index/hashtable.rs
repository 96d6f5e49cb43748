//! Bucketed hash table index.
//!
//! ## File Format
//! ```text
//! table          2^used_bits slots × pointer_bytes, LE
//!                0 = empty, otherwise first bucket + 1
//!
//! buckets        ┌────────────────┬─────────────────┬─────────────────┐
//!                │ hash           │ value + 1       │ next bucket + 1 │
//!                │ (hash_length)  │ (pointer_bytes) │ (pointer_bytes) │
//!                └────────────────┴─────────────────┴─────────────────┘
//!                value 0 = vacated, next 0 = end of chain
//!
//! buckets.count  next free bucket (bincode u64)
//! ```
//!
//! The table slot is the low `used_bits` bits of the hash's leading bytes
//! read as little-endian. Keys landing in the same slot share a chain and
//! are told apart by their full hash. Vacated buckets are reused by the
//! next key added to the same chain.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::IndexLookup;
use crate::error::{DbError, IoContext, Result};
use crate::hash::KeyHasher;
use crate::util::{read_exact_at, read_uint_le, write_all_at, write_uint_le};

const TABLE_FILE: &str = "table";
const BUCKETS_FILE: &str = "buckets";
const COUNT_FILE: &str = "buckets.count";

// =============================================================================
// Shape
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Shape {
    used_bits: u32,
    pointer_bytes: usize,
    hash_length: usize,
}

impl Shape {
    fn slots(&self) -> u64 {
        1u64 << self.used_bits
    }

    fn table_size(&self) -> u64 {
        self.slots() * self.pointer_bytes as u64
    }

    fn record_size(&self) -> u64 {
        (self.hash_length + 2 * self.pointer_bytes) as u64
    }

    fn max_pointer(&self) -> u64 {
        if self.pointer_bytes == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.pointer_bytes)) - 1
        }
    }

    fn slot(&self, hash: &[u8]) -> u64 {
        let lead = &hash[..hash.len().min(8)];
        read_uint_le(lead, lead.len()) & (self.slots() - 1)
    }
}

struct Record {
    hash: Vec<u8>,
    value: u64,
    next: u64,
}

/// Outcome of walking a slot's chain for one hash
enum Walk {
    /// Bucket carrying the hash, with its raw value (0 when vacated)
    Found { bucket: u64, raw: u64 },
    Missing {
        /// Last bucket of the chain, `None` for an empty slot
        tail: Option<u64>,
        /// First vacated bucket seen on the way
        vacant: Option<u64>,
    },
}

// =============================================================================
// State
// =============================================================================

struct Binding<K: ?Sized> {
    hasher: Arc<dyn KeyHasher<K>>,
    dir: PathBuf,
    shape: Shape,
}

enum Phase<K: ?Sized> {
    Uninitialized,
    Initialized(Binding<K>),
    Active(Binding<K>, ActiveTable),
    Closed,
}

struct ActiveTable {
    table_path: PathBuf,
    buckets_path: PathBuf,
    count_path: PathBuf,
    table: File,
    buckets: File,
    next_bucket: u64,
    dirty: bool,
}

impl ActiveTable {
    fn open(dir: &Path, shape: &Shape) -> Result<Self> {
        let table_path = dir.join(TABLE_FILE);
        let buckets_path = dir.join(BUCKETS_FILE);
        let count_path = dir.join(COUNT_FILE);

        let next_bucket = match fs::read(&count_path) {
            Ok(raw) => bincode::deserialize(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e).at("read bucket counter", &count_path),
        };

        let table = open_rw(&table_path, "open hash table")?;
        let len = table.metadata().at("stat hash table", &table_path)?.len();
        if len < shape.table_size() {
            table
                .set_len(shape.table_size())
                .at("size hash table", &table_path)?;
        }
        let buckets = open_rw(&buckets_path, "open hash buckets")?;
        let held = buckets.metadata().at("stat hash buckets", &buckets_path)?.len();
        if held < next_bucket * shape.record_size() {
            warn!(
                path = %buckets_path.display(),
                next_bucket,
                len = held,
                "bucket file is shorter than its counter"
            );
        }

        debug!(
            path = %table_path.display(),
            slots = shape.slots(),
            next_bucket,
            "hash table index loaded"
        );
        Ok(Self {
            table_path,
            buckets_path,
            count_path,
            table,
            buckets,
            next_bucket,
            dirty: false,
        })
    }

    fn read_head(&self, s: &Shape, slot: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        read_exact_at(
            &self.table,
            &mut buf[..s.pointer_bytes],
            slot * s.pointer_bytes as u64,
        )
        .at("read table slot", &self.table_path)?;
        Ok(read_uint_le(&buf, s.pointer_bytes))
    }

    fn write_head(&mut self, s: &Shape, slot: u64, raw: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        write_uint_le(&mut buf, s.pointer_bytes, raw);
        self.dirty = true;
        write_all_at(&self.table, &buf[..s.pointer_bytes], slot * s.pointer_bytes as u64)
            .at("write table slot", &self.table_path)
    }

    fn read_record(&self, s: &Shape, bucket: u64) -> Result<Record> {
        if bucket >= self.next_bucket {
            return Err(DbError::Corrupt(format!(
                "bucket {} was never allocated (next is {})",
                bucket, self.next_bucket
            )));
        }
        let mut raw = vec![0u8; s.record_size() as usize];
        read_exact_at(&self.buckets, &mut raw, bucket * s.record_size()).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DbError::Corrupt(format!("bucket {} lies past the end of the file", bucket))
            } else {
                DbError::IoAt {
                    op: "read bucket",
                    path: self.buckets_path.clone(),
                    source: e,
                }
            }
        })?;
        let (hash, tail) = raw.split_at(s.hash_length);
        Ok(Record {
            hash: hash.to_vec(),
            value: read_uint_le(tail, s.pointer_bytes),
            next: read_uint_le(&tail[s.pointer_bytes..], s.pointer_bytes),
        })
    }

    fn write_record(&mut self, s: &Shape, bucket: u64, hash: &[u8], value: u64, next: u64) -> Result<()> {
        let mut raw = Vec::with_capacity(s.record_size() as usize);
        raw.extend_from_slice(hash);
        let mut ptr = [0u8; 8];
        write_uint_le(&mut ptr, s.pointer_bytes, value);
        raw.extend_from_slice(&ptr[..s.pointer_bytes]);
        write_uint_le(&mut ptr, s.pointer_bytes, next);
        raw.extend_from_slice(&ptr[..s.pointer_bytes]);
        self.dirty = true;
        write_all_at(&self.buckets, &raw, bucket * s.record_size())
            .at("write bucket", &self.buckets_path)
    }

    /// Overwrite one pointer field of a bucket; `field` 0 is the value, 1 the link
    fn write_field(&mut self, s: &Shape, bucket: u64, field: usize, raw: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        write_uint_le(&mut buf, s.pointer_bytes, raw);
        let at = bucket * s.record_size() + (s.hash_length + field * s.pointer_bytes) as u64;
        self.dirty = true;
        write_all_at(&self.buckets, &buf[..s.pointer_bytes], at)
            .at("write bucket pointer", &self.buckets_path)
    }

    fn walk(&self, s: &Shape, hash: &[u8]) -> Result<Walk> {
        let mut link = self.read_head(s, s.slot(hash))?;
        let mut tail = None;
        let mut vacant = None;
        let mut steps = 0u64;
        while link != 0 {
            let bucket = link - 1;
            steps += 1;
            if steps > self.next_bucket {
                return Err(DbError::Corrupt(format!(
                    "bucket chain through {} loops",
                    bucket
                )));
            }
            let record = self.read_record(s, bucket)?;
            if record.hash == hash {
                return Ok(Walk::Found {
                    bucket,
                    raw: record.value,
                });
            }
            if record.value == 0 && vacant.is_none() {
                vacant = Some(bucket);
            }
            tail = Some(bucket);
            link = record.next;
        }
        Ok(Walk::Missing { tail, vacant })
    }

    fn lookup(&self, s: &Shape, hash: &[u8]) -> Result<Option<u64>> {
        match self.walk(s, hash)? {
            Walk::Found { raw, .. } => Ok(raw.checked_sub(1)),
            Walk::Missing { .. } => Ok(None),
        }
    }

    fn store(&mut self, s: &Shape, hash: &[u8], value: u64) -> Result<()> {
        let encoded = value
            .checked_add(1)
            .filter(|&v| v <= s.max_pointer())
            .ok_or_else(|| {
                DbError::InvalidArgument(format!(
                    "value {} does not fit in {} pointer bytes",
                    value, s.pointer_bytes
                ))
            })?;

        match self.walk(s, hash)? {
            Walk::Found { bucket, .. } => self.write_field(s, bucket, 0, encoded),
            Walk::Missing {
                vacant: Some(bucket),
                ..
            } => {
                let next = self.read_record(s, bucket)?.next;
                self.write_record(s, bucket, hash, encoded, next)
            }
            Walk::Missing { tail, vacant: None } => {
                let bucket = self.allocate(s)?;
                self.write_record(s, bucket, hash, encoded, 0)?;
                match tail {
                    Some(tail) => self.write_field(s, tail, 1, bucket + 1),
                    None => self.write_head(s, s.slot(hash), bucket + 1),
                }
            }
        }
    }

    fn allocate(&mut self, s: &Shape) -> Result<u64> {
        let bucket = self.next_bucket;
        if bucket + 1 > s.max_pointer() {
            return Err(DbError::InvalidArgument(format!(
                "hash table is full: bucket {} does not fit in {} pointer bytes",
                bucket, s.pointer_bytes
            )));
        }
        self.next_bucket += 1;
        self.dirty = true;
        Ok(bucket)
    }

    fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let raw = bincode::serialize(&self.next_bucket)?;
        fs::write(&self.count_path, raw).at("write bucket counter", &self.count_path)?;
        self.table.sync_data().at("sync hash table", &self.table_path)?;
        self.buckets
            .sync_data()
            .at("sync hash buckets", &self.buckets_path)?;
        self.dirty = false;
        Ok(())
    }

    fn clear(&mut self, s: &Shape) -> Result<()> {
        self.table.set_len(0).at("truncate hash table", &self.table_path)?;
        self.table
            .set_len(s.table_size())
            .at("size hash table", &self.table_path)?;
        self.buckets
            .set_len(0)
            .at("truncate hash buckets", &self.buckets_path)?;
        self.next_bucket = 0;
        self.dirty = true;
        Ok(())
    }
}

fn open_rw(path: &Path, op: &'static str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .at(op, path)
}

// =============================================================================
// HashTableIndexLookup
// =============================================================================

/// Hash table from key hash to `u64`, chaining colliding keys in buckets
///
/// ## Concurrency:
/// - One reader/writer lock over the whole index
/// - `get`/`contains`/`run_if_contains` share it, everything else is exclusive
pub struct HashTableIndexLookup<K: ?Sized> {
    used_bits: u32,
    pointer_bytes: usize,
    state: RwLock<Phase<K>>,
}

impl<K: ?Sized> HashTableIndexLookup<K> {
    /// `used_bits` (1-32) sizes the table at `2^used_bits` slots
    pub fn new(used_bits: u32, pointer_bytes: usize) -> Result<Self> {
        if !(1..=32).contains(&used_bits) {
            return Err(DbError::InvalidConfig(format!(
                "used bits must be in range 1-32 (given: {})",
                used_bits
            )));
        }
        if !(1..=8).contains(&pointer_bytes) {
            return Err(DbError::InvalidConfig(format!(
                "pointer byte count must be in range 1-8 (given: {})",
                pointer_bytes
            )));
        }
        Ok(Self {
            used_bits,
            pointer_bytes,
            state: RwLock::new(Phase::Uninitialized),
        })
    }

    pub fn used_bits(&self) -> u32 {
        self.used_bits
    }

    pub fn pointer_bytes(&self) -> usize {
        self.pointer_bytes
    }

    /// Buckets handed out so far, vacated ones included
    pub fn bucket_count(&self) -> Result<u64> {
        let state = self.state.read();
        let (_, table) = active(&*state)?;
        Ok(table.next_bucket)
    }
}

fn active<K: ?Sized>(phase: &Phase<K>) -> Result<(&Binding<K>, &ActiveTable)> {
    match phase {
        Phase::Active(binding, table) => Ok((binding, table)),
        Phase::Closed => Err(DbError::AlreadyClosed("hash table index")),
        _ => Err(DbError::NotInitialized("hash table index")),
    }
}

fn active_mut<K: ?Sized>(phase: &mut Phase<K>) -> Result<(&Binding<K>, &mut ActiveTable)> {
    match phase {
        Phase::Active(binding, table) => Ok((&*binding, table)),
        Phase::Closed => Err(DbError::AlreadyClosed("hash table index")),
        _ => Err(DbError::NotInitialized("hash table index")),
    }
}

impl<K: ?Sized> Binding<K> {
    fn hash(&self, key: &K) -> Result<Vec<u8>> {
        let hash = self.hasher.hash(key);
        if hash.len() != self.shape.hash_length {
            return Err(DbError::InvalidArgument(format!(
                "hasher produced {} bytes, index expects {}",
                hash.len(),
                self.shape.hash_length
            )));
        }
        Ok(hash)
    }
}

impl<K: ?Sized> IndexLookup<K> for HashTableIndexLookup<K> {
    fn layout(&self) -> String {
        format!("hashtable:{}:{}", self.used_bits, self.pointer_bytes)
    }

    fn init(&self, hasher: Arc<dyn KeyHasher<K>>, dir: &Path) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            Phase::Uninitialized => {}
            Phase::Closed => return Err(DbError::AlreadyClosed("hash table index")),
            _ => return Err(DbError::AlreadyInitialized("hash table index")),
        }

        let hash_length = hasher.hash_length();
        if hash_length == 0 {
            return Err(DbError::InvalidConfig(
                "hash table index needs a hash of at least one byte".into(),
            ));
        }
        let shape = Shape {
            used_bits: self.used_bits,
            pointer_bytes: self.pointer_bytes,
            hash_length,
        };
        fs::create_dir_all(dir).at("create index directory", dir)?;

        info!(
            dir = %dir.display(),
            slots = shape.slots(),
            "hash table index initialized"
        );
        *state = Phase::Initialized(Binding {
            hasher,
            dir: dir.to_path_buf(),
            shape,
        });
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let mut state = self.state.write();
        let binding = match mem::replace(&mut *state, Phase::Uninitialized) {
            Phase::Initialized(binding) => binding,
            other => {
                let err = match &other {
                    Phase::Uninitialized => DbError::NotInitialized("hash table index"),
                    Phase::Closed => DbError::AlreadyClosed("hash table index"),
                    _ => DbError::AlreadyInitialized("hash table index"),
                };
                *state = other;
                return Err(err);
            }
        };
        match ActiveTable::open(&binding.dir, &binding.shape) {
            Ok(table) => {
                *state = Phase::Active(binding, table);
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
        let (binding, table) = active(&*state)?;
        table.lookup(&binding.shape, &binding.hash(key)?)
    }

    fn set(&self, key: &K, value: u64) -> Result<()> {
        let mut state = self.state.write();
        let (binding, table) = active_mut(&mut *state)?;
        table.store(&binding.shape, &binding.hash(key)?, value)
    }

    fn remove(&self, key: &K) -> Result<Option<u64>> {
        let mut state = self.state.write();
        let (binding, table) = active_mut(&mut *state)?;
        let s = &binding.shape;
        match table.walk(s, &binding.hash(key)?)? {
            Walk::Found { bucket, raw } if raw != 0 => {
                table.write_field(s, bucket, 0, 0)?;
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
        let (binding, table) = active_mut(&mut *state)?;
        let hash = binding.hash(key)?;
        let current = table.lookup(&binding.shape, &hash)?;
        let next = f(current)?;
        table.store(&binding.shape, &hash, next)?;
        Ok(next)
    }

    fn change_if_contains<F>(&self, key: &K, f: F) -> Result<bool>
    where
        F: FnOnce(u64) -> Result<u64>,
    {
        let mut state = self.state.write();
        let (binding, table) = active_mut(&mut *state)?;
        let hash = binding.hash(key)?;
        let Some(current) = table.lookup(&binding.shape, &hash)? else {
            return Ok(false);
        };
        let next = f(current)?;
        table.store(&binding.shape, &hash, next)?;
        Ok(true)
    }

    fn run_if_contains<T, F>(&self, key: &K, f: F) -> Result<Option<T>>
    where
        F: FnOnce(u64) -> Result<T>,
    {
        let state = self.state.read();
        let (binding, table) = active(&*state)?;
        match table.lookup(&binding.shape, &binding.hash(key)?)? {
            Some(value) => f(value).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        let (_, table) = active_mut(&mut *state)?;
        table.save()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        match &mut *state {
            Phase::Active(_, table) => table.save()?,
            Phase::Closed => return Err(DbError::AlreadyClosed("hash table index")),
            _ => {}
        }
        *state = Phase::Closed;
        debug!("hash table index closed");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let (binding, table) = active_mut(&mut *state)?;
        table.clear(&binding.shape)?;
        info!(dir = %binding.dir.display(), "hash table index cleared");
        Ok(())
    }
}
