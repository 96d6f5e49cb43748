//! Tests for StreamingDataLookup
//!
//! These tests verify:
//! - Values of any length round-trip as one contiguous run
//! - Rewrites stay in place when they fit and release the surplus
//! - Growing values move and free their old run
//! - The used-sector bitmap survives reopen
//! - Values can be read through a streaming reader

use std::io::Read;
use std::path::Path;

use porkdb::data::{DataLookup, StreamingDataLookup};
use porkdb::DbError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_data(dir: &Path, sector_size: usize) -> StreamingDataLookup {
    let data = StreamingDataLookup::new(sector_size).unwrap();
    data.init(dir).unwrap();
    data.load().unwrap();
    data
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 17 % 256) as u8).collect()
}

// =============================================================================
// Round-Trip Tests
// =============================================================================

#[test]
fn test_values_of_many_sizes() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    // 56 payload bytes fit the first sector
    for len in [0usize, 1, 56, 57, 120, 121, 4_000] {
        let value = pattern(len);
        let id = data.write(None, &value).unwrap();
        assert_eq!(data.read(id).unwrap(), value, "length {}", len);
    }
}

#[test]
fn test_runs_are_contiguous() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let first = data.write(None, &pattern(100)).unwrap();
    let second = data.write(None, b"next").unwrap();
    assert_eq!(first, 0);
    assert_eq!(second, 2);
    assert_eq!(data.used_sectors().unwrap(), 3);
}

#[test]
fn test_reader_streams_value() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);
    let value = pattern(1_000);
    let id = data.write(None, &value).unwrap();
    data.write(None, b"after").unwrap();

    let mut out = Vec::new();
    data.reader(id).unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, value);
}

// =============================================================================
// Rewrite Tests
// =============================================================================

#[test]
fn test_shrinking_rewrite_stays_in_place() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let id = data.write(None, &pattern(200)).unwrap();
    assert_eq!(data.used_sectors().unwrap(), 4);

    let again = data.write(Some(id), b"tiny").unwrap();
    assert_eq!(again, id);
    assert_eq!(data.used_sectors().unwrap(), 1);
    assert_eq!(data.read(id).unwrap(), b"tiny");

    // The released tail is handed out next
    assert_eq!(data.write(None, b"tail").unwrap(), id + 1);
}

#[test]
fn test_growing_rewrite_moves_and_frees() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let small = data.write(None, b"small").unwrap();
    let blocker = data.write(None, b"blocker").unwrap();
    let moved = data.write(Some(small), &pattern(300)).unwrap();

    assert_ne!(moved, small);
    assert_eq!(data.read(moved).unwrap(), pattern(300));
    assert_eq!(data.read(blocker).unwrap(), b"blocker");
    assert!(matches!(data.read(small), Err(DbError::Corrupt(_))));
    assert_eq!(data.write(None, b"x").unwrap(), small);
}

#[test]
fn test_remove_frees_whole_run() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let id = data.write(None, &pattern(500)).unwrap();
    data.remove(id).unwrap();
    assert_eq!(data.used_sectors().unwrap(), 0);
    assert!(matches!(data.read(id), Err(DbError::Corrupt(_))));
    assert!(matches!(data.remove(id), Err(DbError::Corrupt(_))));
}

#[test]
fn test_clear_truncates() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);
    for i in 0..10 {
        data.write(None, &pattern(i * 50)).unwrap();
    }

    data.clear().unwrap();
    assert_eq!(data.used_sectors().unwrap(), 0);
    assert_eq!(std::fs::metadata(temp_dir.path().join("stream")).unwrap().len(), 0);
    assert_eq!(data.write(None, b"again").unwrap(), 0);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_bitmap_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let (kept, freed) = {
        let data = setup_data(temp_dir.path(), 128);
        let freed = data.write(None, b"temporary").unwrap();
        let kept = data.write(None, &pattern(700)).unwrap();
        data.remove(freed).unwrap();
        data.close().unwrap();
        (kept, freed)
    };

    let data = setup_data(temp_dir.path(), 128);
    assert_eq!(data.read(kept).unwrap(), pattern(700));
    assert!(matches!(data.read(freed), Err(DbError::Corrupt(_))));
    assert_eq!(data.write(None, b"x").unwrap(), freed);
}

#[test]
fn test_lifecycle_errors() {
    let temp_dir = TempDir::new().unwrap();
    let data = StreamingDataLookup::new(64).unwrap();
    assert!(matches!(data.read(0), Err(DbError::NotInitialized(_))));

    data.init(temp_dir.path()).unwrap();
    data.load().unwrap();
    data.close().unwrap();
    assert!(matches!(data.write(None, b"v"), Err(DbError::AlreadyClosed(_))));
    assert!(matches!(data.reader(0), Err(DbError::AlreadyClosed(_))));
}
