//! Positioned file I/O shared by the index, data and file layers.
//!
//! Positioned reads never move a shared cursor, so readers holding only a
//! shared lock can use the same `File` concurrently.

use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

/// Largest zero-fill chunk written in one call
const ZERO_CHUNK: usize = 64 * 1024;

/// Read exactly `buf.len()` bytes starting at `offset`
#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

/// Write all of `buf` starting at `offset`
#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Overwrite `len` bytes at `offset` with zeros
pub(crate) fn write_zeros_at(file: &File, offset: u64, len: u64) -> io::Result<()> {
    let zeros = vec![0u8; ZERO_CHUNK.min(len as usize)];
    let mut written = 0u64;
    while written < len {
        let n = (len - written).min(zeros.len() as u64) as usize;
        write_all_at(file, &zeros[..n], offset + written)?;
        written += n as u64;
    }
    Ok(())
}

/// Read a little-endian unsigned integer of `width` (1-8) bytes
pub(crate) fn read_uint_le(buf: &[u8], width: usize) -> u64 {
    buf[..width]
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Write the low `width` (1-8) bytes of `val`, least-significant first
pub(crate) fn write_uint_le(buf: &mut [u8], width: usize, val: u64) {
    for (i, b) in buf[..width].iter_mut().enumerate() {
        *b = (val >> (i * 8)) as u8;
    }
}
