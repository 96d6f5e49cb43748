//! Tree File Manager
//!
//! Stores every sub-hash in its own file under a two-level directory tree.
//!
//! ## Responsibilities
//! - Route a key to `root/{hex(byte0)}/{hex(rest)}{ext}`
//! - Cache open files in an arena keyed by hash-of-hash
//! - Close idle files once the cache exceeds `max_open_files`
//! - Drain all leases on shutdown

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{DbError, IoContext, Result};
use crate::hash::HashedKey;

use super::{EntryVisitor, FileManager, OpenFile};

/// How often shutdown re-runs GC while waiting
const SHUTDOWN_RETRY: Duration = Duration::from_millis(25);

/// One cached file and the sub-hash it belongs to
struct Handle {
    sub_hash: Box<[u8]>,
    route: u64,
    file: Arc<OpenFile>,
}

/// Arena of open handles
///
/// Handles live at stable ids; `by_route` buckets ids by hash-of-hash so
/// a 64-bit collision between sub-hashes never shares a file.
#[derive(Default)]
struct HandleTable {
    handles: Vec<Option<Handle>>,
    free_ids: Vec<usize>,
    by_route: HashMap<u64, Vec<usize>>,
    live: usize,
}

impl HandleTable {
    fn find(&self, route: u64, sub_hash: &[u8]) -> Option<&Handle> {
        self.by_route.get(&route)?.iter().find_map(|&id| {
            self.handles[id]
                .as_ref()
                .filter(|h| &*h.sub_hash == sub_hash)
        })
    }

    fn insert(&mut self, handle: Handle) -> usize {
        let route = handle.route;
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.handles[id] = Some(handle);
                id
            }
            None => {
                self.handles.push(Some(handle));
                self.handles.len() - 1
            }
        };
        self.by_route.entry(route).or_default().push(id);
        self.live += 1;
        id
    }

    fn evict(&mut self, id: usize) {
        if let Some(handle) = self.handles[id].take() {
            if let Some(ids) = self.by_route.get_mut(&handle.route) {
                ids.retain(|&i| i != id);
                if ids.is_empty() {
                    self.by_route.remove(&handle.route);
                }
            }
            self.free_ids.push(id);
            self.live -= 1;
        }
    }
}

/// A handle checked out for one operation
///
/// Dropping the lease releases the file and runs best-effort GC.
struct FileLease<'a> {
    manager: &'a TreeFileManager,
    file: Arc<OpenFile>,
}

impl std::ops::Deref for FileLease<'_> {
    type Target = OpenFile;

    fn deref(&self) -> &OpenFile {
        &self.file
    }
}

impl Drop for FileLease<'_> {
    fn drop(&mut self) {
        self.file.release();
        self.manager.after_release();
    }
}

/// File manager storing one file per sub-hash
///
/// ## Concurrency:
/// - `table`: one mutex over the arena and load-count bookkeeping
/// - Byte I/O runs outside the table lock, serialized per file
/// - `released`: signalled whenever a lease is dropped (wakes shutdown)
/// - `shutting_down` refuses new leases; `drained` is set once shutdown
///   has closed every handle
pub struct TreeFileManager {
    root: PathBuf,
    extension: String,
    value_size: Option<usize>,
    max_open_files: usize,
    table: Mutex<HandleTable>,
    released: Condvar,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    drained: AtomicBool,
}

impl TreeFileManager {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.data_dir.clone(),
            extension: config.entry_extension.clone(),
            value_size: config.value_size,
            max_open_files: config.max_open_files,
            table: Mutex::new(HandleTable::default()),
            released: Condvar::new(),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Number of handles currently cached
    pub fn open_file_count(&self) -> usize {
        self.table.lock().live
    }

    /// Root directory of this manager
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Force a GC pass, closing every idle handle. Returns how many closed.
    pub fn collect_idle(&self) -> usize {
        let mut table = self.table.lock();
        self.gc_locked(&mut table, true)
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Path of the file for a sub-hash: `root/{hex(byte0)}/{hex(rest)}{ext}`
    fn path_for(&self, sub_hash: &[u8]) -> PathBuf {
        self.root
            .join(hex::encode(&sub_hash[..1]))
            .join(format!("{}{}", hex::encode(&sub_hash[1..]), self.extension))
    }

    /// Check out the file for a key, creating it if missing
    fn lease(&self, key: &HashedKey) -> Result<FileLease<'_>> {
        let mut table = self.table.lock();
        self.check_open()?;
        self.checkout(&mut table, key)
    }

    /// Check out the file for a key only if it is cached or on disk
    fn lease_existing(&self, key: &HashedKey) -> Result<Option<FileLease<'_>>> {
        let mut table = self.table.lock();
        self.check_open()?;
        if table.find(key.hash_hash(), key.sub_hash()).is_none()
            && !self.path_for(key.sub_hash()).exists()
        {
            return Ok(None);
        }
        self.checkout(&mut table, key).map(Some)
    }

    fn checkout(&self, table: &mut HandleTable, key: &HashedKey) -> Result<FileLease<'_>> {
        if let Some(handle) = table.find(key.hash_hash(), key.sub_hash()) {
            handle.file.retain();
            return Ok(FileLease {
                manager: self,
                file: Arc::clone(&handle.file),
            });
        }

        let path = self.path_for(key.sub_hash());
        let file = Arc::new(OpenFile::open(&path, self.value_size)?);
        debug!(path = %path.display(), "opened backing file");
        file.retain();
        table.insert(Handle {
            sub_hash: key.sub_hash().into(),
            route: key.hash_hash(),
            file: Arc::clone(&file),
        });
        Ok(FileLease {
            manager: self,
            file,
        })
    }

    /// Checked under the table lock so no lease starts after shutdown drains
    fn check_open(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(DbError::NotInitialized("tree file manager"));
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("tree file manager"));
        }
        Ok(())
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    fn after_release(&self) {
        let mut table = self.table.lock();
        self.gc_locked(&mut table, false);
        self.released.notify_all();
    }

    /// Close and evict idle handles if forced or over budget
    ///
    /// Eviction is unordered among idle handles. Handles that fail to close
    /// stay cached and are retried on the next pass.
    fn gc_locked(&self, table: &mut HandleTable, force: bool) -> usize {
        if !force && table.live <= self.max_open_files {
            return 0;
        }

        let idle: Vec<usize> = table
            .handles
            .iter()
            .enumerate()
            .filter_map(|(id, h)| h.as_ref().filter(|h| h.file.can_close()).map(|_| id))
            .collect();

        let mut closed = 0;
        for id in idle {
            let result = match &table.handles[id] {
                Some(handle) => handle.file.close(),
                None => continue,
            };
            match result {
                Ok(()) => {
                    table.evict(id);
                    closed += 1;
                }
                Err(e) => warn!(error = %e, "failed to close backing file, will retry"),
            }
        }

        if closed > 0 {
            debug!(closed, live = table.live, force, "file gc pass");
        }
        closed
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Parse `root/{hex(b0)}/{hex(rest)}{ext}` back into a sub-hash
    fn sub_hash_from_path(&self, bucket: &str, file_name: &str) -> Option<Vec<u8>> {
        let byte0 = hex::decode(bucket).ok().filter(|b| b.len() == 1)?;
        let rest = hex::decode(file_name.strip_suffix(self.extension.as_str())?).ok()?;
        let mut sub_hash = byte0;
        sub_hash.extend_from_slice(&rest);
        Some(sub_hash)
    }

    fn sub_hashes_on_disk(&self) -> Result<Vec<Vec<u8>>> {
        let mut found = Vec::new();
        for bucket in fs::read_dir(&self.root).at("list root", &self.root)? {
            let bucket = bucket.at("list root", &self.root)?;
            let bucket_path = bucket.path();
            if !bucket_path.is_dir() {
                continue;
            }
            let bucket_name = bucket.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(&bucket_path).at("list bucket", &bucket_path)? {
                let entry = entry.at("list bucket", &bucket_path)?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(sub_hash) = self.sub_hash_from_path(&bucket_name, &name) {
                    found.push(sub_hash);
                }
            }
        }
        Ok(found)
    }
}

impl FileManager for TreeFileManager {
    fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(DbError::AlreadyInitialized("tree file manager"));
        }
        if let Err(e) = fs::create_dir_all(&self.root).at("create root", &self.root) {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(root = %self.root.display(), max_open_files = self.max_open_files, "tree file manager ready");
        Ok(())
    }

    fn get(&self, key: &HashedKey) -> Result<Option<Vec<u8>>> {
        match self.lease_existing(key)? {
            Some(file) => file.get(key.slot()),
            None => Ok(None),
        }
    }

    fn put(&self, key: &HashedKey, value: &[u8]) -> Result<()> {
        self.lease(key)?.put(key.slot(), value)
    }

    fn remove(&self, key: &HashedKey) -> Result<bool> {
        match self.lease_existing(key)? {
            Some(file) => file.remove(key.slot()),
            None => Ok(false),
        }
    }

    fn contains(&self, key: &HashedKey) -> Result<bool> {
        match self.lease_existing(key)? {
            Some(file) => file.contains(key.slot()),
            None => Ok(false),
        }
    }

    fn for_each(&self, visitor: &mut EntryVisitor<'_>) -> Result<()> {
        self.check_open()?;
        for sub_hash in self.sub_hashes_on_disk()? {
            let slot_at = sub_hash.len();
            let mut full = sub_hash;
            full.push(0);
            let key = HashedKey::new(full.clone())?;
            let Some(file) = self.lease_existing(&key)? else {
                continue;
            };
            for slot in file.present_slots()? {
                if let Some(value) = file.get(slot)? {
                    full[slot_at] = slot;
                    visitor(&full, Bytes::from(value))?;
                }
            }
        }
        Ok(())
    }

    /// Wait for every lease to drop, closing handles as they go idle
    ///
    /// Steps:
    /// 1. Refuse new operations
    /// 2. Force GC; stop once the arena is empty
    /// 3. Otherwise wait for a release (or the retry interval) and repeat
    ///
    /// A call that timed out leaves the manager closed to new work; calling
    /// again resumes the drain. Only a finished shutdown makes later calls
    /// fail with `AlreadyClosed`.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        if self.drained.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("tree file manager"));
        }
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(root = %self.root.display(), "resuming shutdown drain");
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut table = self.table.lock();
        loop {
            self.gc_locked(&mut table, true);
            if table.live == 0 {
                break;
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(remaining = table.live, "shutdown timed out");
                        return Err(DbError::ShutdownTimeout {
                            remaining: table.live,
                        });
                    }
                    SHUTDOWN_RETRY.min(deadline - now)
                }
                None => SHUTDOWN_RETRY,
            };
            debug!(remaining = table.live, "waiting for open files to drain");
            self.released.wait_for(&mut table, wait);
        }

        if self.drained.swap(true, Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("tree file manager"));
        }
        info!(root = %self.root.display(), "tree file manager shut down");
        Ok(())
    }
}
