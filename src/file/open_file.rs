//! OpenFile: an in-process handle to one backing file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::constant::ConstantLengthFile;
use super::sectored::SectoredFile;
use crate::error::{IoContext, Result};

/// Storage strategy of a backing file
enum FileKind {
    Constant(ConstantLengthFile),
    Sectored(SectoredFile),
}

/// One open backing file plus the count of operations currently using it
///
/// ## Concurrency:
/// - `loaded_entries`: atomic, bumped by the owning manager under its table lock
/// - File state: guarded by a mutex inside each variant
pub struct OpenFile {
    path: PathBuf,
    kind: FileKind,
    loaded_entries: AtomicUsize,
}

impl OpenFile {
    /// Open the file at `path`, creating parent directories as needed
    ///
    /// `value_size` selects a constant-length file; `None` a sectored file.
    pub fn open(path: &Path, value_size: Option<usize>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at("create bucket directory", parent)?;
        }
        let kind = match value_size {
            Some(size) => FileKind::Constant(ConstantLengthFile::open(path, size)?),
            None => FileKind::Sectored(SectoredFile::open(path)?),
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            loaded_entries: AtomicUsize::new(0),
        })
    }

    pub fn get(&self, slot: u8) -> Result<Option<Vec<u8>>> {
        match &self.kind {
            FileKind::Constant(f) => f.get(slot),
            FileKind::Sectored(f) => f.get(slot),
        }
    }

    pub fn put(&self, slot: u8, value: &[u8]) -> Result<()> {
        match &self.kind {
            FileKind::Constant(f) => f.put(slot, value),
            FileKind::Sectored(f) => f.put(slot, value),
        }
    }

    /// Returns whether a value was removed
    pub fn remove(&self, slot: u8) -> Result<bool> {
        match &self.kind {
            FileKind::Constant(f) => f.remove(slot),
            FileKind::Sectored(f) => f.remove(slot),
        }
    }

    pub fn contains(&self, slot: u8) -> Result<bool> {
        match &self.kind {
            FileKind::Constant(f) => f.contains(slot),
            FileKind::Sectored(f) => f.contains(slot),
        }
    }

    pub fn present_slots(&self) -> Result<Vec<u8>> {
        match &self.kind {
            FileKind::Constant(f) => f.present_slots(),
            FileKind::Sectored(f) => f.present_slots(),
        }
    }

    /// Sync and release the file. Later operations fail with `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        match &self.kind {
            FileKind::Constant(f) => f.close(),
            FileKind::Sectored(f) => f.close(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of in-flight operations using this file
    pub fn loaded_entries(&self) -> usize {
        self.loaded_entries.load(Ordering::SeqCst)
    }

    pub fn can_close(&self) -> bool {
        self.loaded_entries() == 0
    }

    pub(crate) fn retain(&self) {
        self.loaded_entries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.loaded_entries.fetch_sub(1, Ordering::SeqCst);
    }
}
