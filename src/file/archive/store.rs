//! Single-file archive of named members.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ magic "PDBA" (4) │ version u16 LE (2)                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record                                                       │
//! │ ┌───────┬───────┬──────────┬──────────┬──────────┬─────────┐ │
//! │ │state 1│flags 1│name_len 2│capacity 4│data_len 4│ crc32 4 │ │
//! │ └───────┴───────┴──────────┴──────────┴──────────┴─────────┘ │
//! │ name (name_len) │ data (capacity, first data_len used)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record ...                                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers little-endian. The CRC covers the stored (possibly
//! deflated) bytes. Freed records keep their size and are reused best-fit.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec;
use crate::config::Compression;
use crate::error::{DbError, IoContext, Result};
use crate::util::{read_exact_at, write_all_at};

const MAGIC: [u8; 4] = *b"PDBA";
const VERSION: u16 = 1;
const FILE_HEADER_SIZE: u64 = 6;
const RECORD_HEADER_SIZE: u64 = 16;

const STATE_FREE: u8 = 0;
const STATE_LIVE: u8 = 1;
const FLAG_DEFLATE: u8 = 0b0000_0001;

// =============================================================================
// Record Header
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    state: u8,
    flags: u8,
    name_len: u16,
    capacity: u32,
    data_len: u32,
    crc: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        buf[0] = self.state;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.name_len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.capacity.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; RECORD_HEADER_SIZE as usize]) -> Self {
        Self {
            state: buf[0],
            flags: buf[1],
            name_len: u16::from_le_bytes([buf[2], buf[3]]),
            capacity: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            crc: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    /// Bytes the record spans, header included
    fn record_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.name_len as u64 + self.capacity as u64
    }
}

/// A live record and where it starts
#[derive(Debug, Clone, Copy)]
struct Member {
    start: u64,
    header: RecordHeader,
}

impl Member {
    fn data_start(&self) -> u64 {
        self.start + RECORD_HEADER_SIZE + self.header.name_len as u64
    }
}

/// A freed record available for reuse
#[derive(Debug, Clone, Copy)]
struct FreeRecord {
    start: u64,
    size: u64,
}

// =============================================================================
// Archive
// =============================================================================

/// Archive of named byte members in one file
///
/// Members are addressed by name; the whole directory is held in memory.
pub struct Archive {
    path: PathBuf,
    compression: Compression,
    inner: Mutex<ArchiveInner>,
}

struct ArchiveInner {
    file: Option<File>,
    members: HashMap<String, Member>,
    free: Vec<FreeRecord>,
    end: u64,
}

impl Archive {
    /// Open or create an archive
    ///
    /// Steps:
    /// 1. Write the file header if the file is new, else verify it
    /// 2. Scan records into the member directory and free list
    /// 3. Cut off a partially written tail record
    pub fn open(path: &Path, compression: Compression) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .at("open archive", path)?;

        let len = file.metadata().at("stat archive", path)?.len();
        if len == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE as usize];
            header[..4].copy_from_slice(&MAGIC);
            header[4..].copy_from_slice(&VERSION.to_le_bytes());
            write_all_at(&file, &header, 0).at("write archive header", path)?;
        } else {
            if len < FILE_HEADER_SIZE {
                return Err(DbError::Corrupt(format!(
                    "{} is too short to be an archive",
                    path.display()
                )));
            }
            let mut header = [0u8; FILE_HEADER_SIZE as usize];
            read_exact_at(&file, &mut header, 0).at("read archive header", path)?;
            if header[..4] != MAGIC {
                return Err(DbError::Corrupt(format!(
                    "{} has a bad archive magic",
                    path.display()
                )));
            }
            let version = u16::from_le_bytes([header[4], header[5]]);
            if version != VERSION {
                return Err(DbError::Corrupt(format!(
                    "{} has unsupported archive version {}",
                    path.display(),
                    version
                )));
            }
        }

        let mut inner = ArchiveInner {
            file: None,
            members: HashMap::new(),
            free: Vec::new(),
            end: FILE_HEADER_SIZE,
        };
        inner.scan(&file, len.max(FILE_HEADER_SIZE), path)?;
        inner.file = Some(file);

        debug!(
            path = %path.display(),
            members = inner.members.len(),
            free = inner.free.len(),
            "archive opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            compression,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a member, `None` if absent
    pub fn fetch(&self, name: &str) -> Result<Option<Bytes>> {
        let (member, stored) = {
            let inner = self.inner.lock();
            let file = inner.file()?;
            let Some(member) = inner.members.get(name).copied() else {
                return Ok(None);
            };
            let mut stored = vec![0u8; member.header.data_len as usize];
            read_exact_at(file, &mut stored, member.data_start())
                .at("read archive member", &self.path)?;
            (member, stored)
        };

        if crc32fast::hash(&stored) != member.header.crc {
            return Err(DbError::Corrupt(format!(
                "checksum mismatch for archive member {}",
                name
            )));
        }
        if member.header.flags & FLAG_DEFLATE != 0 {
            return Ok(Some(Bytes::from(codec::inflate(&stored)?)));
        }
        Ok(Some(Bytes::from(stored)))
    }

    /// Write a member, replacing any previous content
    pub fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let (stored, flags) = match self.compression {
            Compression::None => (data.to_vec(), 0),
            Compression::Deflate(_) => (codec::compress(self.compression, data)?, FLAG_DEFLATE),
        };
        let name_len = u16::try_from(name.len()).map_err(|_| {
            DbError::InvalidArgument(format!("member name of {} bytes is too long", name.len()))
        })?;
        let data_len = u32::try_from(stored.len()).map_err(|_| {
            DbError::InvalidArgument(format!("member of {} bytes is too large", stored.len()))
        })?;
        let crc = crc32fast::hash(&stored);

        let mut inner = self.inner.lock();
        inner.file()?;

        // Step 1: overwrite in place when the old record has room
        if let Some(member) = inner.members.get(name).copied() {
            if member.header.capacity >= data_len {
                let header = RecordHeader {
                    state: STATE_LIVE,
                    flags,
                    name_len,
                    capacity: member.header.capacity,
                    data_len,
                    crc,
                };
                write_all_at(inner.file()?, &stored, member.data_start())
                    .at("write archive member", &self.path)?;
                write_all_at(inner.file()?, &header.encode(), member.start)
                    .at("write archive record header", &self.path)?;
                inner.members.insert(
                    name.to_string(),
                    Member {
                        start: member.start,
                        header,
                    },
                );
                return Ok(());
            }
            inner.free_member(name, &self.path)?;
        }

        // Step 2: reuse the smallest free record that fits, else append
        let needed = RECORD_HEADER_SIZE + name_len as u64 + data_len as u64;
        let (start, capacity, appended) = match inner.take_best_fit(needed, name_len) {
            Some((record, capacity)) => (record.start, capacity, false),
            None => (inner.end, data_len, true),
        };

        let header = RecordHeader {
            state: STATE_LIVE,
            flags,
            name_len,
            capacity,
            data_len,
            crc,
        };
        let mut record = Vec::with_capacity(needed as usize);
        record.extend_from_slice(&header.encode());
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(&stored);
        write_all_at(inner.file()?, &record, start).at("write archive record", &self.path)?;

        if appended {
            inner.end = start + needed;
        }
        inner.members.insert(name.to_string(), Member { start, header });
        Ok(())
    }

    /// Returns whether a member was removed
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.file()?;
        if !inner.members.contains_key(name) {
            return Ok(false);
        }
        inner.free_member(name, &self.path)?;
        Ok(true)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        let inner = self.inner.lock();
        inner.file()?;
        Ok(inner.members.contains_key(name))
    }

    /// Names of all live members
    pub fn names(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        inner.file()?;
        Ok(inner.members.keys().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of freed records waiting for reuse
    pub fn free_records(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Bytes spanned by the header and all records
    pub fn file_len(&self) -> u64 {
        self.inner.lock().end
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file()?.sync_all().at("sync archive", &self.path)
    }

    /// Sync and release the file. Later operations fail with `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_ref() {
            file.sync_all().at("sync archive", &self.path)?;
            inner.file = None;
        }
        Ok(())
    }
}

impl ArchiveInner {
    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(DbError::AlreadyClosed("archive"))
    }

    fn scan(&mut self, file: &File, len: u64, path: &Path) -> Result<()> {
        let mut pos = FILE_HEADER_SIZE;
        while pos < len {
            let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
            if len - pos < RECORD_HEADER_SIZE {
                return self.truncate_tail(file, pos, len, path);
            }
            read_exact_at(file, &mut buf, pos).at("read archive record header", path)?;
            let header = RecordHeader::decode(&buf);
            if header.state > STATE_LIVE || pos + header.record_size() > len {
                return self.truncate_tail(file, pos, len, path);
            }

            if header.state == STATE_LIVE {
                let mut name = vec![0u8; header.name_len as usize];
                read_exact_at(file, &mut name, pos + RECORD_HEADER_SIZE)
                    .at("read archive member name", path)?;
                let name = String::from_utf8(name).map_err(|_| {
                    DbError::Corrupt(format!("archive member at offset {} has a bad name", pos))
                })?;
                let member = Member { start: pos, header };
                if let Some(stale) = self.members.insert(name, member) {
                    self.free.push(FreeRecord {
                        start: stale.start,
                        size: stale.header.record_size(),
                    });
                }
            } else {
                self.free.push(FreeRecord {
                    start: pos,
                    size: header.record_size(),
                });
            }
            pos += header.record_size();
        }
        self.end = pos;
        Ok(())
    }

    fn truncate_tail(&mut self, file: &File, pos: u64, len: u64, path: &Path) -> Result<()> {
        warn!(
            path = %path.display(),
            offset = pos,
            dropped = len - pos,
            "partial archive record at tail, truncating"
        );
        file.set_len(pos).at("truncate archive", path)?;
        self.end = pos;
        Ok(())
    }

    /// Mark a member's record free on disk and in memory
    fn free_member(&mut self, name: &str, path: &Path) -> Result<()> {
        if let Some(member) = self.members.get(name).copied() {
            write_all_at(self.file()?, &[STATE_FREE], member.start)
                .at("free archive record", path)?;
            self.members.remove(name);
            self.free.push(FreeRecord {
                start: member.start,
                size: member.header.record_size(),
            });
        }
        Ok(())
    }

    /// Remove and return the smallest free record of at least `needed` bytes,
    /// with the data capacity it offers for a name of `name_len` bytes
    fn take_best_fit(&mut self, needed: u64, name_len: u16) -> Option<(FreeRecord, u32)> {
        let (index, record, capacity) = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, r)| r.size >= needed)
            .filter_map(|(i, r)| {
                let capacity = r.size - RECORD_HEADER_SIZE - name_len as u64;
                u32::try_from(capacity).ok().map(|c| (i, *r, c))
            })
            .min_by_key(|(_, r, _)| r.size)?;
        self.free.swap_remove(index);
        Some((record, capacity))
    }
}
