//! Contiguous-run data file.
//!
//! ## File Format (`stream`)
//! ```text
//! ┌──────────── run of n sectors (id = first sector) ────────────┐
//! │ len u64 LE │ payload (len bytes)                │ slack       │
//! └──────────────────────────────────────────────────────────────┘
//! n = ceil((8 + len) / sector_size), at least 1
//! ```
//!
//! Because a value occupies consecutive sectors, it can be read through a
//! plain `Read` without walking a chain. The used-sector bitmap lives in
//! `stream.sectors` (bincode).

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use super::DataLookup;
use crate::bitmap::SectorBitmap;
use crate::error::{DbError, IoContext, Result};
use crate::util::{read_exact_at, write_all_at};

const STREAM_FILE: &str = "stream";
const SECTORS_FILE: &str = "stream.sectors";
const LENGTH_PREFIX: usize = 8;
const MIN_SECTOR_SIZE: usize = 64;

struct StreamFile {
    data_path: PathBuf,
    sectors_path: PathBuf,
    file: File,
    used: SectorBitmap,
    dirty: bool,
}

enum Phase {
    Uninitialized,
    Active(StreamFile),
    Closed,
}

/// Values stored as one run of consecutive sectors
///
/// Rewrites stay in place when the new value fits the old run; the surplus
/// tail is released. Otherwise the value moves to the first free run that
/// is long enough and the old run is released after the move.
///
/// ## Concurrency:
/// - `read`/`reader` share the lock; everything else is exclusive
pub struct StreamingDataLookup {
    sector_size: usize,
    state: RwLock<Phase>,
}

impl StreamingDataLookup {
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

    /// Stream a value without buffering it
    ///
    /// The reader holds its own handle on the file, so it outlives the lock.
    /// Rewriting or removing `id` while the reader is in use leaves it
    /// reading whatever lands in those sectors.
    pub fn reader(&self, id: u64) -> Result<Take<File>> {
        let state = self.state.read();
        let stream = active(&*state)?;
        let len = self.checked_len(stream, id)?;
        let mut file = stream
            .file
            .try_clone()
            .at("clone data handle", &stream.data_path)?;
        file.seek(SeekFrom::Start(self.payload_offset(id)))
            .at("seek to value", &stream.data_path)?;
        Ok(file.take(len))
    }

    fn run_length(&self, len: u64) -> u64 {
        let total = LENGTH_PREFIX as u64 + len;
        total.div_ceil(self.sector_size as u64)
    }

    fn payload_offset(&self, id: u64) -> u64 {
        id * self.sector_size as u64 + LENGTH_PREFIX as u64
    }

    /// Length stored at `id`, after checking the whole run is allocated
    fn checked_len(&self, stream: &StreamFile, id: u64) -> Result<u64> {
        if !stream.used.get(id) {
            return Err(DbError::Corrupt(format!("sector {} is not allocated", id)));
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        read_exact_at(&stream.file, &mut prefix, id * self.sector_size as u64).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                DbError::Corrupt(format!("sector {} lies past the end of the data file", id))
            } else {
                DbError::IoAt {
                    op: "read value length",
                    path: stream.data_path.clone(),
                    source: e,
                }
            }
        })?;
        let len = u64::from_le_bytes(prefix);
        let run = self.run_length(len);
        if let Some(hole) = (id..id + run).find(|&s| !stream.used.get(s)) {
            return Err(DbError::Corrupt(format!(
                "value at sector {} claims {} bytes but sector {} is free",
                id, len, hole
            )));
        }
        Ok(len)
    }

    fn write_run(&self, stream: &StreamFile, id: u64, bytes: &[u8]) -> Result<()> {
        let mut run = Vec::with_capacity(LENGTH_PREFIX + bytes.len());
        run.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        run.extend_from_slice(bytes);
        write_all_at(&stream.file, &run, id * self.sector_size as u64)
            .at("write value", &stream.data_path)
    }
}

fn release(stream: &mut StreamFile, from: u64, to: u64) {
    for sector in from..to {
        stream.used.clear(sector);
    }
    stream.dirty = true;
}

fn active(phase: &Phase) -> Result<&StreamFile> {
    match phase {
        Phase::Active(stream) => Ok(stream),
        Phase::Uninitialized => Err(DbError::NotInitialized("streaming data")),
        Phase::Closed => Err(DbError::AlreadyClosed("streaming data")),
    }
}

fn active_mut(phase: &mut Phase) -> Result<&mut StreamFile> {
    match phase {
        Phase::Active(stream) => Ok(stream),
        Phase::Uninitialized => Err(DbError::NotInitialized("streaming data")),
        Phase::Closed => Err(DbError::AlreadyClosed("streaming data")),
    }
}

impl DataLookup for StreamingDataLookup {
    fn layout(&self) -> String {
        format!("streaming:{}", self.sector_size)
    }

    fn init(&self, dir: &Path) -> Result<()> {
        let mut state = self.state.write();
        match &*state {
            Phase::Uninitialized => {}
            Phase::Active(_) => return Err(DbError::AlreadyInitialized("streaming data")),
            Phase::Closed => return Err(DbError::AlreadyClosed("streaming data")),
        }
        fs::create_dir_all(dir).at("create data directory", dir)?;
        let data_path = dir.join(STREAM_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .at("open data file", &data_path)?;
        *state = Phase::Active(StreamFile {
            data_path,
            sectors_path: dir.join(SECTORS_FILE),
            file,
            used: SectorBitmap::new(),
            dirty: false,
        });
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let mut state = self.state.write();
        let stream = active_mut(&mut *state)?;
        match fs::read(&stream.sectors_path) {
            Ok(raw) => stream.used = bincode::deserialize(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => stream.used = SectorBitmap::new(),
            Err(e) => return Err(e).at("read sector bitmap", &stream.sectors_path),
        }
        debug!(
            path = %stream.data_path.display(),
            used = stream.used.count_ones(),
            "streaming data loaded"
        );
        Ok(())
    }

    fn read(&self, id: u64) -> Result<Vec<u8>> {
        let state = self.state.read();
        let stream = active(&*state)?;
        let len = self.checked_len(stream, id)?;
        let len = usize::try_from(len)
            .map_err(|_| DbError::Corrupt(format!("value at sector {} is too large", id)))?;
        let mut out = vec![0u8; len];
        read_exact_at(&stream.file, &mut out, self.payload_offset(id))
            .at("read value", &stream.data_path)?;
        Ok(out)
    }

    /// Steps:
    /// 1. If `old` has room, overwrite it in place and release its tail
    /// 2. Otherwise write into the first free run long enough
    /// 3. Mark the new run, then release the old one
    fn write(&self, old: Option<u64>, bytes: &[u8]) -> Result<u64> {
        let mut state = self.state.write();
        let stream = active_mut(&mut *state)?;
        let needed = self.run_length(bytes.len() as u64);

        let old_run = match old {
            Some(old) => Some((old, self.run_length(self.checked_len(stream, old)?))),
            None => None,
        };

        if let Some((old, held)) = old_run {
            if needed <= held {
                self.write_run(stream, old, bytes)?;
                if needed < held {
                    release(stream, old + needed, old + held);
                }
                trace!(id = old, sectors = needed, "value rewritten in place");
                return Ok(old);
            }
        }

        let id = stream.used.find_clear_run(0, needed);
        self.write_run(stream, id, bytes)?;
        for sector in id..id + needed {
            stream.used.set(sector);
        }
        stream.dirty = true;
        if let Some((old, held)) = old_run {
            release(stream, old, old + held);
        }
        trace!(id, sectors = needed, "value written");
        Ok(id)
    }

    fn remove(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let stream = active_mut(&mut *state)?;
        let run = self.run_length(self.checked_len(stream, id)?);
        release(stream, id, id + run);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let stream = active_mut(&mut *state)?;
        stream
            .file
            .set_len(0)
            .at("truncate data file", &stream.data_path)?;
        stream.used.reset();
        stream.dirty = true;
        info!(path = %stream.data_path.display(), "streaming data cleared");
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let mut state = self.state.write();
        let stream = active_mut(&mut *state)?;
        if !stream.dirty {
            return Ok(());
        }
        let raw = bincode::serialize(&stream.used)?;
        fs::write(&stream.sectors_path, raw).at("write sector bitmap", &stream.sectors_path)?;
        stream
            .file
            .sync_data()
            .at("sync data file", &stream.data_path)?;
        stream.dirty = false;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.save().or_else(|e| match e {
            DbError::NotInitialized(_) => Ok(()),
            other => Err(other),
        })?;
        let mut state = self.state.write();
        if let Phase::Closed = &*state {
            return Err(DbError::AlreadyClosed("streaming data"));
        }
        *state = Phase::Closed;
        Ok(())
    }
}
