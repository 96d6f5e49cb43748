//! Archive File Manager
//!
//! Keeps every entry as a member of one archive file `data.{suffix}`.
//!
//! ## Responsibilities
//! - Name members by the hex of the full key hash
//! - Serialize access per sub-hash through lazily created `CountingLock`s
//! - Drop idle locks once the map exceeds its budget
//! - Drain every lock user on shutdown, then sync and close the archive

mod lock;
mod store;

pub use lock::{CountingLock, LockTicket};
pub use store::Archive;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Compression, Config};
use crate::error::{DbError, IoContext, Result};
use crate::hash::HashedKey;

use super::{EntryVisitor, FileManager};

const SHUTDOWN_RETRY: Duration = Duration::from_millis(25);

/// A registered lock user for one operation
///
/// Dropping unregisters the user and runs best-effort GC on the lock map.
struct EntryLease<'a> {
    manager: &'a ArchiveFileManager,
    archive: Arc<Archive>,
    ticket: Option<LockTicket>,
}

impl EntryLease<'_> {
    /// Run `f` on the archive while holding this entry's lock
    fn with<T>(&self, f: impl FnOnce(&Archive) -> Result<T>) -> Result<T> {
        match &self.ticket {
            Some(ticket) => {
                let _held = ticket.hold();
                f(&self.archive)
            }
            None => Err(DbError::AlreadyClosed("archive entry")),
        }
    }
}

impl Drop for EntryLease<'_> {
    fn drop(&mut self) {
        drop(self.ticket.take());
        self.manager.after_release();
    }
}

/// File manager storing every entry inside one archive
///
/// ## Concurrency:
/// - `locks`: map of sub-hash → `CountingLock`; users are counted under it
/// - `archive`: internally synchronized; per-entry order comes from the locks
/// - `released`: signalled whenever a lease is dropped (wakes shutdown)
/// - `shutting_down` refuses new leases; `closed` is set once shutdown has
///   drained the locks and closed the archive
pub struct ArchiveFileManager {
    root: PathBuf,
    suffix: String,
    compression: Compression,
    max_locks: usize,
    archive: Mutex<Option<Arc<Archive>>>,
    locks: Mutex<HashMap<Box<[u8]>, Arc<CountingLock>>>,
    released: Condvar,
    shutting_down: AtomicBool,
    closed: AtomicBool,
}

impl ArchiveFileManager {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.data_dir.clone(),
            suffix: config.archive_suffix.clone(),
            compression: config.archive_compression,
            max_locks: config.max_open_files,
            archive: Mutex::new(None),
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Path of the archive file
    pub fn archive_path(&self) -> PathBuf {
        self.root.join(format!("data.{}", self.suffix))
    }

    /// Number of live counting locks
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    fn member_name(key: &HashedKey) -> String {
        hex::encode(key.hash())
    }

    /// The open archive, or why there is none
    fn current_archive(&self) -> Result<Arc<Archive>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("archive file manager"));
        }
        self.archive
            .lock()
            .clone()
            .ok_or(DbError::NotInitialized("archive file manager"))
    }

    fn enter(&self, key: &HashedKey) -> Result<EntryLease<'_>> {
        let archive = self.current_archive()?;

        let mut locks = self.locks.lock();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("archive file manager"));
        }
        let ticket = locks
            .entry(key.sub_hash().into())
            .or_insert_with(|| Arc::new(CountingLock::new()))
            .enter();
        Ok(EntryLease {
            manager: self,
            archive,
            ticket: Some(ticket),
        })
    }

    fn after_release(&self) {
        let mut locks = self.locks.lock();
        self.gc_locked(&mut locks, false);
        self.released.notify_all();
    }

    /// Drop idle locks if forced or over budget
    fn gc_locked(&self, locks: &mut HashMap<Box<[u8]>, Arc<CountingLock>>, force: bool) {
        if !force && locks.len() <= self.max_locks {
            return;
        }
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_idle());
        if before != locks.len() {
            debug!(dropped = before - locks.len(), live = locks.len(), force, "lock gc pass");
        }
    }
}

impl FileManager for ArchiveFileManager {
    fn init(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("archive file manager"));
        }
        let mut slot = self.archive.lock();
        if slot.is_some() {
            return Err(DbError::AlreadyInitialized("archive file manager"));
        }
        fs::create_dir_all(&self.root).at("create root", &self.root)?;
        let archive = Archive::open(&self.archive_path(), self.compression)?;
        info!(
            path = %archive.path().display(),
            members = archive.len(),
            "archive file manager ready"
        );
        *slot = Some(Arc::new(archive));
        Ok(())
    }

    fn get(&self, key: &HashedKey) -> Result<Option<Vec<u8>>> {
        let name = Self::member_name(key);
        let lease = self.enter(key)?;
        lease.with(|archive| Ok(archive.fetch(&name)?.map(|b| b.to_vec())))
    }

    fn put(&self, key: &HashedKey, value: &[u8]) -> Result<()> {
        let name = Self::member_name(key);
        let lease = self.enter(key)?;
        lease.with(|archive| archive.put(&name, value))
    }

    fn remove(&self, key: &HashedKey) -> Result<bool> {
        let name = Self::member_name(key);
        let lease = self.enter(key)?;
        lease.with(|archive| archive.remove(&name))
    }

    fn contains(&self, key: &HashedKey) -> Result<bool> {
        let name = Self::member_name(key);
        let lease = self.enter(key)?;
        lease.with(|archive| archive.contains(&name))
    }

    fn for_each(&self, visitor: &mut EntryVisitor<'_>) -> Result<()> {
        let archive = self.current_archive()?;

        for name in archive.names()? {
            let hash = match hex::decode(&name) {
                Ok(hash) if hash.len() >= 2 => hash,
                _ => {
                    warn!(member = %name, "skipping archive member with a foreign name");
                    continue;
                }
            };
            let key = HashedKey::new(hash)?;
            // The entry stays registered, not locked, while the visitor runs
            let lease = self.enter(&key)?;
            if let Some(value) = lease.with(|archive| archive.fetch(&name))? {
                visitor(key.hash(), value)?;
            }
        }
        Ok(())
    }

    /// Wait for every lock to go idle, then sync and close the archive
    ///
    /// After a timeout or a failed close, calling again resumes where the
    /// last call stopped.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("archive file manager"));
        }
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(root = %self.root.display(), "resuming shutdown drain");
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        {
            let mut locks = self.locks.lock();
            loop {
                self.gc_locked(&mut locks, true);
                if locks.is_empty() {
                    break;
                }
                let wait = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            warn!(remaining = locks.len(), "shutdown timed out");
                            return Err(DbError::ShutdownTimeout {
                                remaining: locks.len(),
                            });
                        }
                        SHUTDOWN_RETRY.min(deadline - now)
                    }
                    None => SHUTDOWN_RETRY,
                };
                debug!(remaining = locks.len(), "waiting for archive locks to drain");
                self.released.wait_for(&mut locks, wait);
            }
        }

        let mut slot = self.archive.lock();
        if let Some(archive) = slot.as_ref() {
            if let Err(e) = archive.close() {
                warn!(error = %e, path = %archive.path().display(), "failed to close archive");
                return Err(e);
            }
        }
        *slot = None;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DbError::AlreadyClosed("archive file manager"));
        }
        info!(root = %self.root.display(), "archive file manager shut down");
        Ok(())
    }
}
