//! Chained-sector data file.
//!
//! ## File Format (`data`)
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ Sector (sector_size bytes)                             │
//! │ ┌──────────────┬─────────────┬───────────────────────┐ │
//! │ │ next i64 LE  │ len u32 LE  │ payload (len bytes)   │ │
//! │ │ -1 = end     │             │                       │ │
//! │ └──────────────┴─────────────┴───────────────────────┘ │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! A value's id is the index of its first sector. The used-sector bitmap
//! lives in `sectors` (bincode).

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::DataLookup;
use crate::bitmap::SectorBitmap;
use crate::error::{DbError, IoContext, Result};
use crate::util::{read_exact_at, write_all_at};

const SECTOR_HEADER_SIZE: usize = 12;
const END_OF_CHAIN: i64 = -1;
const MIN_SECTOR_SIZE: usize = 64;

struct DataFile {
    data_path: PathBuf,
    sectors_path: PathBuf,
    file: File,
    used: SectorBitmap,
    dirty: bool,
}

enum Phase {
    Uninitialized,
    Active(DataFile),
    Closed,
}

/// Values split across fixed-size sectors of one file
///
/// ## Concurrency:
/// - `read` shares the lock; `write`/`remove`/`clear`/`save` are exclusive
pub struct SectoredDataLookup {
    sector_size: usize,
    state: RwLock<Phase>,
}

impl SectoredDataLookup {
    pub fn new(sector_size: usize) -> Result<Self> {
        if sector_size < MIN_SECTOR_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "sector size must be at least {} bytes (given: {})",
                MIN_SECTOR_SIZE, sector_size
            )));
        }
        Ok(Self {
            sector_size,
            state: RwLock::new(Phase::Uninitialized),
        })
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Sectors currently allocated
    pub fn used_sectors(&self) -> Result<u64> {
        let state = self.state.read();
        Ok(active(&*state)?.used.count_ones())
    }

    fn payload_size(&self) -> usize {
        self.sector_size - SECTOR_HEADER_SIZE
    }

    fn read_header(&self, data: &DataFile, id: u64) -> Result<(i64, u32)> {
        let mut header = [0u8; SECTOR_HEADER_SIZE];
        read_exact_at(&data.file, &mut header, id * self.sector_size as u64).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DbError::Corrupt(format!("sector {} lies past the end of the data file", id))
            } else {
                DbError::IoAt {
                    op: "read sector header",
                    path: data.data_path.clone(),
                    source: e,
                }
            }
        })?;
        let next = i64::from_le_bytes(header[..8].try_into().map_err(|_| bad_header(id))?);
        let len = u32::from_le_bytes(header[8..].try_into().map_err(|_| bad_header(id))?);
        if len as usize > self.payload_size() {
            return Err(DbError::Corrupt(format!(
                "sector {} claims {} payload bytes, at most {} fit",
                id,
                len,
                self.payload_size()
            )));
        }
        Ok((next, len))
    }

    /// Walk a chain, calling `visit(id, next, len)` for each sector
    fn walk(
        &self,
        data: &DataFile,
        first: u64,
        mut visit: impl FnMut(u64, i64, u32) -> Result<()>,
    ) -> Result<()> {
        let limit = data.used.count_ones();
        let mut id = first;
        let mut steps = 0u64;
        loop {
            if !data.used.get(id) {
                return Err(DbError::Corrupt(format!("sector {} is not allocated", id)));
            }
            steps += 1;
            if steps > limit {
                return Err(DbError::Corrupt(format!("sector chain from {} loops", first)));
            }
            let (next, len) = self.read_header(data, id)?;
            visit(id, next, len)?;
            if next == END_OF_CHAIN {
                return Ok(());
            }
            id = u64::try_from(next).map_err(|_| bad_header(id))?;
        }
    }

    fn free_chain(&self, data: &mut DataFile, first: u64) -> Result<()> {
        let mut chain = Vec::new();
        self.walk(data, first, |id, _, _| {
            chain.push(id);
            Ok(())
        })?;
        for id in chain {
            data.used.clear(id);
        }
        data.dirty = true;
        Ok(())
    }
}

fn bad_header(id: u64) -> DbError {
    DbError::Corrupt(format!("sector {} has a malformed header", id))
}

fn active(phase: &Phase) -> Result<&DataFile> {
    match phase {
        Phase::Active(data) => Ok(data),
        Phase::Uninitialized => Err(DbError::NotInitialized("sectored data")),
        Phase::Closed => Err(DbError::AlreadyClosed("sectored data")),
    }
}

fn active_mut(phase: &mut Phase) -> Result<&mut DataFile> {
    match phase {
        Phase::Active(data) => Ok(data),
        Phase::Uninitialized => Err(DbError::NotInitialized("sectored data")),
        Phase::Closed => Err(DbError::AlreadyClosed("sectored data")),
    }
}

impl DataLookup for SectoredDataLookup {
    fn layout(&self) -> String {
        format!("sectored:{}", self.sector_size)
    }

    fn init(&self, dir: &Path) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            Phase::Uninitialized => {}
            Phase::Active(_) => return Err(DbError::AlreadyInitialized("sectored data")),
            Phase::Closed => return Err(DbError::AlreadyClosed("sectored data")),
        }
        fs::create_dir_all(dir).at("create data directory", dir)?;
        let data_path = dir.join("data");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .at("open data file", &data_path)?;
        *state = Phase::Active(DataFile {
            data_path,
            sectors_path: dir.join("sectors"),
            file,
            used: SectorBitmap::new(),
            dirty: false,
        });
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let mut state = self.state.write();
        let data = active_mut(&mut *state)?;
        match fs::read(&data.sectors_path) {
            Ok(raw) => data.used = bincode::deserialize(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => data.used = SectorBitmap::new(),
            Err(e) => return Err(e).at("read sector bitmap", &data.sectors_path),
        }
        debug!(
            path = %data.data_path.display(),
            used = data.used.count_ones(),
            "sectored data loaded"
        );
        Ok(())
    }

    fn read(&self, id: u64) -> Result<Vec<u8>> {
        let state = self.state.read();
        let data = active(&*state)?;
        let mut out = Vec::new();
        self.walk(data, id, |sector, _, len| {
            let start = out.len();
            out.resize(start + len as usize, 0);
            let offset = sector * self.sector_size as u64 + SECTOR_HEADER_SIZE as u64;
            read_exact_at(&data.file, &mut out[start..], offset).at("read sector", &data.data_path)
        })?;
        Ok(out)
    }

    /// Steps:
    /// 1. Free the chain behind `old`, if any
    /// 2. Claim one sector per payload-sized chunk (at least one)
    /// 3. Write each sector with a link to the next
    fn write(&self, old: Option<u64>, bytes: &[u8]) -> Result<u64> {
        let mut state = self.state.write();
        let data = active_mut(&mut *state)?;

        if let Some(old) = old {
            self.free_chain(data, old)?;
        }

        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![bytes]
        } else {
            bytes.chunks(self.payload_size()).collect()
        };
        let mut ids = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            let id = data.used.next_clear(0);
            data.used.set(id);
            ids.push(id);
        }
        data.dirty = true;

        let mut sector = Vec::with_capacity(self.sector_size);
        for (i, chunk) in chunks.iter().enumerate() {
            let next = ids.get(i + 1).map_or(END_OF_CHAIN, |&n| n as i64);
            sector.clear();
            sector.extend_from_slice(&next.to_le_bytes());
            sector.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            sector.extend_from_slice(chunk);
            write_all_at(&data.file, &sector, ids[i] * self.sector_size as u64)
                .at("write sector", &data.data_path)?;
        }
        Ok(ids[0])
    }

    fn remove(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let data = active_mut(&mut *state)?;
        self.free_chain(data, id)
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let data = active_mut(&mut *state)?;
        data.file.set_len(0).at("truncate data file", &data.data_path)?;
        data.used.reset();
        data.dirty = true;
        info!(path = %data.data_path.display(), "sectored data cleared");
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        let data = active_mut(&mut *state)?;
        if !data.dirty {
            return Ok(());
        }
        let raw = bincode::serialize(&data.used)?;
        fs::write(&data.sectors_path, raw).at("write sector bitmap", &data.sectors_path)?;
        data.file.sync_data().at("sync data file", &data.data_path)?;
        data.dirty = false;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.save().or_else(|e| match e {
            DbError::NotInitialized(_) => Ok(()),
            other => Err(other),
        })?;
        let mut state = self.state.write();
        if let Phase::Closed = &*state {
            return Err(DbError::AlreadyClosed("sectored data"));
        }
        *state = Phase::Closed;
        Ok(())
    }
}
