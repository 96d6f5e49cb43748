//! Value compression helpers

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use crate::config::Compression;
use crate::error::{DbError, Result};

/// Compress `data` with the given scheme
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate(level) => {
            let mut encoder = DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2),
                flate2::Compression::new(level.min(9)),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Reverse `compress`
pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Deflate(_) => inflate(data),
    }
}

/// Inflate a raw deflate stream
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| DbError::Corrupt(format!("deflate stream: {}", e)))?;
    Ok(out)
}
