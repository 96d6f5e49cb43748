//! Constant-length record file.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────┬───────────┬───────────┬─────┬─────────────┐
//! │ presence bitmap (32) │ slot 0    │ slot 1    │ ... │ slot 255    │
//! │ bit n = slot n used  │ (v bytes) │ (v bytes) │     │ (v bytes)   │
//! └──────────────────────┴───────────┴───────────┴─────┴─────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{DbError, IoContext, Result};
use crate::util::{read_exact_at, write_all_at};

const HEADER_SIZE: u64 = 32;

/// A file holding 256 values of exactly `value_size` bytes each
pub struct ConstantLengthFile {
    path: PathBuf,
    value_size: usize,
    inner: Mutex<ConstantInner>,
}

struct ConstantInner {
    file: Option<File>,
    present: [u8; HEADER_SIZE as usize],
}

impl ConstantLengthFile {
    /// Open or create the file at `path`
    ///
    /// An existing file must have exactly the layout implied by `value_size`.
    pub fn open(path: &Path, value_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .at("open constant-length file", path)?;

        let expected = HEADER_SIZE + 256 * value_size as u64;
        let len = file.metadata().at("stat constant-length file", path)?.len();
        let mut present = [0u8; HEADER_SIZE as usize];
        if len == 0 {
            file.set_len(expected).at("size constant-length file", path)?;
        } else if len != expected {
            return Err(DbError::InvalidConfig(format!(
                "{} holds {} bytes, expected {} for {}-byte values",
                path.display(),
                len,
                expected,
                value_size
            )));
        } else {
            read_exact_at(&file, &mut present, 0).at("read presence bitmap", path)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            value_size,
            inner: Mutex::new(ConstantInner {
                file: Some(file),
                present,
            }),
        })
    }

    pub fn get(&self, slot: u8) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        let file = inner.file()?;
        if !inner.is_present(slot) {
            return Ok(None);
        }
        let mut value = vec![0u8; self.value_size];
        read_exact_at(file, &mut value, self.offset(slot)).at("read record", &self.path)?;
        Ok(Some(value))
    }

    pub fn put(&self, slot: u8, value: &[u8]) -> Result<()> {
        if value.len() != self.value_size {
            return Err(DbError::SizeMismatch {
                expected: self.value_size,
                actual: value.len(),
            });
        }
        let mut inner = self.inner.lock();
        write_all_at(inner.file()?, value, self.offset(slot)).at("write record", &self.path)?;
        inner.present[slot as usize / 8] |= 1 << (slot % 8);
        inner.write_presence(slot, &self.path)
    }

    pub fn remove(&self, slot: u8) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.file()?;
        if !inner.is_present(slot) {
            return Ok(false);
        }
        inner.present[slot as usize / 8] &= !(1 << (slot % 8));
        inner.write_presence(slot, &self.path)?;
        Ok(true)
    }

    pub fn contains(&self, slot: u8) -> Result<bool> {
        let inner = self.inner.lock();
        inner.file()?;
        Ok(inner.is_present(slot))
    }

    /// Slots currently holding a value
    pub fn present_slots(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner.file()?;
        Ok((0..=255u8).filter(|&s| inner.is_present(s)).collect())
    }

    /// Sync and release the handle. A failed sync keeps the file open.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_ref() {
            file.sync_all().at("sync constant-length file", &self.path)?;
            inner.file = None;
        }
        Ok(())
    }

    fn offset(&self, slot: u8) -> u64 {
        HEADER_SIZE + slot as u64 * self.value_size as u64
    }
}

impl ConstantInner {
    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(DbError::AlreadyClosed("open file"))
    }

    fn is_present(&self, slot: u8) -> bool {
        self.present[slot as usize / 8] & (1 << (slot % 8)) != 0
    }

    fn write_presence(&self, slot: u8, path: &Path) -> Result<()> {
        let byte = slot as usize / 8;
        write_all_at(self.file()?, &self.present[byte..byte + 1], byte as u64)
            .at("write presence bitmap", path)
    }
}
