//! Counting lock: a mutex that also tracks how many callers want it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// Per-entry lock plus a user count
///
/// The count is bumped while the owning map is locked, so GC never drops a
/// lock someone is about to take.
#[derive(Default)]
pub struct CountingLock {
    users: AtomicUsize,
    mutex: Mutex<()>,
}

impl CountingLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callers holding or waiting on this lock
    pub fn users(&self) -> usize {
        self.users.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.users() == 0
    }

    /// Register a user. The returned ticket unregisters on drop.
    pub fn enter(self: &Arc<Self>) -> LockTicket {
        self.users.fetch_add(1, Ordering::SeqCst);
        LockTicket {
            lock: Arc::clone(self),
        }
    }
}

/// A registered user of a `CountingLock`
pub struct LockTicket {
    lock: Arc<CountingLock>,
}

impl LockTicket {
    /// Block until this user owns the lock
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.lock.mutex.lock()
    }
}

impl Drop for LockTicket {
    fn drop(&mut self) {
        self.lock.users.fetch_sub(1, Ordering::SeqCst);
    }
}
