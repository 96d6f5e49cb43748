//! Tests for SectoredDataLookup
//!
//! These tests verify:
//! - Values of any length round-trip through sector chains
//! - Freed sectors are reused
//! - The used-sector bitmap survives reopen
//! - Dangling ids and lifecycle misuse are reported

use std::path::Path;

use porkdb::data::{DataLookup, SectoredDataLookup};
use porkdb::DbError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_data(dir: &Path, sector_size: usize) -> SectoredDataLookup {
    let data = SectoredDataLookup::new(sector_size).unwrap();
    data.init(dir).unwrap();
    data.load().unwrap();
    data
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

// =============================================================================
// Round-Trip Tests
// =============================================================================

#[test]
fn test_values_of_many_sizes() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 128);

    // 116 payload bytes per sector
    for len in [0usize, 1, 115, 116, 117, 232, 1000] {
        let value = pattern(len);
        let id = data.write(None, &value).unwrap();
        assert_eq!(data.read(id).unwrap(), value, "length {}", len);
    }
}

#[test]
fn test_empty_value_takes_one_sector() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let id = data.write(None, &[]).unwrap();
    assert_eq!(data.used_sectors().unwrap(), 1);
    assert!(data.read(id).unwrap().is_empty());
}

#[test]
fn test_rewrite_replaces_value() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let id = data.write(None, &pattern(10)).unwrap();
    let id = data.write(Some(id), &pattern(300)).unwrap();
    assert_eq!(data.read(id).unwrap(), pattern(300));

    let id = data.write(Some(id), b"short").unwrap();
    assert_eq!(data.read(id).unwrap(), b"short");
    assert_eq!(data.used_sectors().unwrap(), 1);
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_removed_sectors_are_reused() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let first = data.write(None, b"first").unwrap();
    let second = data.write(None, b"second").unwrap();
    assert_eq!((first, second), (0, 1));

    data.remove(first).unwrap();
    assert_eq!(data.used_sectors().unwrap(), 1);

    let third = data.write(None, b"third").unwrap();
    assert_eq!(third, first);
    assert_eq!(data.read(second).unwrap(), b"second");
    assert_eq!(data.read(third).unwrap(), b"third");
}

#[test]
fn test_reading_freed_id_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);

    let id = data.write(None, b"gone").unwrap();
    data.remove(id).unwrap();

    assert!(matches!(data.read(id), Err(DbError::Corrupt(_))));
    assert!(matches!(data.read(1_000), Err(DbError::Corrupt(_))));
}

#[test]
fn test_clear_releases_all_sectors() {
    let temp_dir = TempDir::new().unwrap();
    let data = setup_data(temp_dir.path(), 64);
    for i in 0..20 {
        data.write(None, &pattern(i * 10)).unwrap();
    }

    data.clear().unwrap();
    assert_eq!(data.used_sectors().unwrap(), 0);
    assert_eq!(std::fs::metadata(temp_dir.path().join("data")).unwrap().len(), 0);

    let id = data.write(None, b"again").unwrap();
    assert_eq!(id, 0);
    assert_eq!(data.read(id).unwrap(), b"again");
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_bitmap_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let (kept, freed) = {
        let data = setup_data(temp_dir.path(), 64);
        let kept = data.write(None, &pattern(200)).unwrap();
        let freed = data.write(None, b"temporary").unwrap();
        data.remove(freed).unwrap();
        data.close().unwrap();
        (kept, freed)
    };

    let data = setup_data(temp_dir.path(), 64);
    assert_eq!(data.read(kept).unwrap(), pattern(200));
    assert!(matches!(data.read(freed), Err(DbError::Corrupt(_))));
    assert_eq!(data.write(None, b"x").unwrap(), freed);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_lifecycle_errors() {
    let temp_dir = TempDir::new().unwrap();
    let data = SectoredDataLookup::new(64).unwrap();

    assert!(matches!(data.read(0), Err(DbError::NotInitialized(_))));

    data.init(temp_dir.path()).unwrap();
    assert!(matches!(
        data.init(temp_dir.path()),
        Err(DbError::AlreadyInitialized(_))
    ));

    data.load().unwrap();
    data.close().unwrap();
    assert!(matches!(data.write(None, b"v"), Err(DbError::AlreadyClosed(_))));
    assert!(matches!(data.close(), Err(DbError::AlreadyClosed(_))));
}
