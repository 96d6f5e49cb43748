//! Error types for PorkDB
//!
//! Provides a unified error type for all operations.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using DbError
pub type Result<T> = std::result::Result<T, DbError>;

/// Unified error type for PorkDB operations
#[derive(Debug, Error)]
pub enum DbError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("IO error during {op} on {}: {source}", path.display())]
    IoAt {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    // -------------------------------------------------------------------------
    // Configuration / Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Value size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("{0} already initialized")]
    AlreadyInitialized(&'static str),

    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    #[error("{0} already closed")]
    AlreadyClosed(&'static str),

    #[error("Shutdown timed out with {remaining} handle(s) still in use")]
    ShutdownTimeout { remaining: usize },

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt data: {0}")]
    Corrupt(String),
}

/// Attaches the failing operation and path to an I/O error.
pub trait IoContext<T> {
    fn at(self, op: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, op: &'static str, path: &Path) -> Result<T> {
        self.map_err(|source| DbError::IoAt {
            op,
            path: path.to_path_buf(),
            source,
        })
    }
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(io) => DbError::Io(io),
            other => DbError::Corrupt(format!("metadata decode failed: {}", other)),
        }
    }
}
