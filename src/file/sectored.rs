//! Sectored variable-length file.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Sector 0: slot table (256 × 12 bytes, BE)   │
//! │ ┌─────────────┬──────────────┬────────────┐ │
//! │ │ start (4)   │ count (4)    │ length (4) │ │
//! │ └─────────────┴──────────────┴────────────┘ │
//! ├─────────────────────────────────────────────┤
//! │ Sectors 1..N: value data, 4096 bytes each   │
//! │ a value uses `length / 4096 + 1` contiguous │
//! │ sectors starting at `start`                 │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! `start == 0` marks an empty slot since sector 0 is always the table.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::bitmap::SectorBitmap;
use crate::error::{DbError, IoContext, Result};
use crate::util::{read_exact_at, write_all_at, write_zeros_at};

/// Size of one sector
pub const SECTOR_BYTES: u64 = 4096;

const SLOTS: usize = 256;
const ENTRY_BYTES: usize = 12;

#[derive(Debug, Clone, Copy, Default)]
struct SlotEntry {
    start: u32,
    count: u32,
    len: u32,
}

impl SlotEntry {
    fn encode(&self) -> [u8; ENTRY_BYTES] {
        let mut buf = [0u8; ENTRY_BYTES];
        buf[0..4].copy_from_slice(&self.start.to_be_bytes());
        buf[4..8].copy_from_slice(&self.count.to_be_bytes());
        buf[8..12].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            start: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            count: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// A file holding 256 variable-length values in 4 KiB sectors
pub struct SectoredFile {
    path: PathBuf,
    inner: Mutex<SectoredInner>,
}

struct SectoredInner {
    file: Option<File>,
    table: [SlotEntry; SLOTS],
    used: SectorBitmap,
    total_sectors: u64,
}

impl SectoredFile {
    /// Open or create the file at `path`
    ///
    /// On open:
    /// 1. Grow new or truncated files to one table sector
    /// 2. Pad files whose length is not sector-aligned
    /// 3. Load the slot table and rebuild the used-sector map
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .at("open sectored file", path)?;

        let mut len = file.metadata().at("stat sectored file", path)?.len();
        if len < SECTOR_BYTES {
            if len != 0 {
                warn!(path = %path.display(), len, "sectored file shorter than its table, resetting");
            }
            write_zeros_at(&file, 0, SECTOR_BYTES).at("write slot table", path)?;
            len = SECTOR_BYTES;
        } else if len % SECTOR_BYTES != 0 {
            let padded = len.div_ceil(SECTOR_BYTES) * SECTOR_BYTES;
            warn!(
                path = %path.display(),
                len,
                grow_by = padded - len,
                "sectored file not aligned, padding"
            );
            file.set_len(padded).at("pad sectored file", path)?;
            len = padded;
        }

        let total_sectors = len / SECTOR_BYTES;
        let mut used = SectorBitmap::new();
        used.set(0);

        let mut header = vec![0u8; SLOTS * ENTRY_BYTES];
        read_exact_at(&file, &mut header, 0).at("read slot table", path)?;

        let mut table = [SlotEntry::default(); SLOTS];
        for (slot, entry) in table.iter_mut().enumerate() {
            let decoded = SlotEntry::decode(&header[slot * ENTRY_BYTES..]);
            if decoded.start == 0 {
                continue;
            }
            let end = decoded.start as u64 + decoded.count as u64;
            if decoded.count == 0 || end > total_sectors {
                warn!(
                    path = %path.display(),
                    slot,
                    start = decoded.start,
                    count = decoded.count,
                    "slot does not fit in file, dropping"
                );
                continue;
            }
            for sector in decoded.start as u64..end {
                used.set(sector);
            }
            *entry = decoded;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(SectoredInner {
                file: Some(file),
                table,
                used,
                total_sectors,
            }),
        })
    }

    pub fn get(&self, slot: u8) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        let file = inner.file()?;
        let entry = inner.table[slot as usize];
        if entry.start == 0 {
            return Ok(None);
        }
        let mut value = vec![0u8; entry.len as usize];
        read_exact_at(file, &mut value, entry.start as u64 * SECTOR_BYTES)
            .at("read sectors", &self.path)?;
        Ok(Some(value))
    }

    /// Write a value, reusing its sectors when the sector count is unchanged
    ///
    /// Otherwise:
    /// 1. Find a free run while the old run is still marked used
    /// 2. Write the value there, then mark the run
    /// 3. Point the slot at the new run
    /// 4. Release the old run
    ///
    /// A failure before step 3 leaves the old value and the bitmap as they were.
    pub fn put(&self, slot: u8, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| {
            DbError::InvalidArgument(format!("value of {} bytes is too large", value.len()))
        })?;
        let needed = (len as u64 / SECTOR_BYTES + 1) as u32;

        let mut inner = self.inner.lock();
        inner.file()?;
        let old = inner.table[slot as usize];
        let entry = |start| SlotEntry {
            start,
            count: needed,
            len,
        };

        if old.start != 0 && old.count == needed {
            write_all_at(inner.file()?, value, old.start as u64 * SECTOR_BYTES)
                .at("write sectors", &self.path)?;
            return inner.set_entry(slot, entry(old.start), &self.path);
        }

        let start = inner.used.find_clear_run(1, needed as u64);
        let end = start + needed as u64;
        let start32 = u32::try_from(start).map_err(|_| {
            DbError::InvalidArgument("sectored file exceeds addressable sectors".to_string())
        })?;
        if end > inner.total_sectors {
            inner
                .file()?
                .set_len(end * SECTOR_BYTES)
                .at("grow sectored file", &self.path)?;
            inner.total_sectors = end;
        }
        write_all_at(inner.file()?, value, start * SECTOR_BYTES)
            .at("write sectors", &self.path)?;

        for sector in start..end {
            inner.used.set(sector);
        }
        if let Err(e) = inner.set_entry(slot, entry(start32), &self.path) {
            for sector in start..end {
                inner.used.clear(sector);
            }
            return Err(e);
        }
        if old.start != 0 {
            for sector in old.start as u64..old.start as u64 + old.count as u64 {
                inner.used.clear(sector);
            }
        }
        Ok(())
    }

    pub fn remove(&self, slot: u8) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.file()?;
        let old = inner.table[slot as usize];
        if old.start == 0 {
            return Ok(false);
        }
        for sector in old.start as u64..old.start as u64 + old.count as u64 {
            inner.used.clear(sector);
        }
        inner.set_entry(slot, SlotEntry::default(), &self.path)?;
        Ok(true)
    }

    pub fn contains(&self, slot: u8) -> Result<bool> {
        let inner = self.inner.lock();
        inner.file()?;
        Ok(inner.table[slot as usize].start != 0)
    }

    /// Slots currently holding a value
    pub fn present_slots(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner.file()?;
        Ok((0..=255u8)
            .filter(|&s| inner.table[s as usize].start != 0)
            .collect())
    }

    /// Number of sectors in the file, including the table
    pub fn total_sectors(&self) -> u64 {
        self.inner.lock().total_sectors
    }

    /// Sync and release the handle. A failed sync keeps the file open.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_ref() {
            file.sync_all().at("sync sectored file", &self.path)?;
            inner.file = None;
        }
        Ok(())
    }
}

impl SectoredInner {
    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(DbError::AlreadyClosed("open file"))
    }

    fn set_entry(&mut self, slot: u8, entry: SlotEntry, path: &Path) -> Result<()> {
        write_all_at(
            self.file()?,
            &entry.encode(),
            slot as u64 * ENTRY_BYTES as u64,
        )
        .at("write slot table", path)?;
        self.table[slot as usize] = entry;
        Ok(())
    }
}
