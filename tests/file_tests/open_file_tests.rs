//! Tests for OpenFile and its two storage variants
//!
//! These tests verify:
//! - Constant-length round-trip, size checks and persistence
//! - Sectored round-trip, in-place rewrites and sector reuse
//! - Padding of misaligned sectored files
//! - Load counter gating `can_close`

use std::fs::OpenOptions;
use std::path::PathBuf;

use porkdb::file::{ConstantLengthFile, OpenFile, SectoredFile, SECTOR_BYTES};
use porkdb::DbError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file(name: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(name);
    (temp_dir, path)
}

// =============================================================================
// ConstantLengthFile Tests
// =============================================================================

#[test]
fn test_constant_round_trip() {
    let (_temp, path) = setup_temp_file("c.pdbe");
    let file = ConstantLengthFile::open(&path, 8).unwrap();

    file.put(0, b"abcdefgh").unwrap();
    file.put(255, b"12345678").unwrap();

    assert_eq!(file.get(0).unwrap().unwrap(), b"abcdefgh");
    assert_eq!(file.get(255).unwrap().unwrap(), b"12345678");
    assert_eq!(file.get(1).unwrap(), None);
    assert_eq!(file.present_slots().unwrap(), vec![0, 255]);
}

#[test]
fn test_constant_rejects_wrong_size() {
    let (_temp, path) = setup_temp_file("c.pdbe");
    let file = ConstantLengthFile::open(&path, 4).unwrap();

    let err = file.put(3, b"too long").unwrap_err();
    assert!(matches!(
        err,
        DbError::SizeMismatch {
            expected: 4,
            actual: 8
        }
    ));
    assert!(!file.contains(3).unwrap());
}

#[test]
fn test_constant_remove_is_idempotent() {
    let (_temp, path) = setup_temp_file("c.pdbe");
    let file = ConstantLengthFile::open(&path, 2).unwrap();

    file.put(9, b"hi").unwrap();
    assert!(file.remove(9).unwrap());
    assert!(!file.remove(9).unwrap());
    assert_eq!(file.get(9).unwrap(), None);
}

#[test]
fn test_constant_persists_presence() {
    let (_temp, path) = setup_temp_file("c.pdbe");
    {
        let file = ConstantLengthFile::open(&path, 3).unwrap();
        file.put(17, b"xyz").unwrap();
        file.put(18, b"uvw").unwrap();
        file.remove(18).unwrap();
        file.close().unwrap();
    }

    let file = ConstantLengthFile::open(&path, 3).unwrap();
    assert_eq!(file.get(17).unwrap().unwrap(), b"xyz");
    assert!(!file.contains(18).unwrap());
}

#[test]
fn test_constant_rejects_mismatched_layout() {
    let (_temp, path) = setup_temp_file("c.pdbe");
    ConstantLengthFile::open(&path, 3).unwrap().close().unwrap();

    assert!(matches!(
        ConstantLengthFile::open(&path, 4),
        Err(DbError::InvalidConfig(_))
    ));
}

#[test]
fn test_constant_closed_file_errors() {
    let (_temp, path) = setup_temp_file("c.pdbe");
    let file = ConstantLengthFile::open(&path, 1).unwrap();
    file.close().unwrap();

    assert!(matches!(file.get(0), Err(DbError::AlreadyClosed(_))));
}

// =============================================================================
// SectoredFile Tests
// =============================================================================

#[test]
fn test_sectored_round_trip_various_sizes() {
    let (_temp, path) = setup_temp_file("s.pdbe");
    let file = SectoredFile::open(&path).unwrap();

    let empty: Vec<u8> = Vec::new();
    let small = b"tiny".to_vec();
    let exact = vec![7u8; SECTOR_BYTES as usize];
    let large = vec![9u8; 3 * SECTOR_BYTES as usize + 11];

    file.put(0, &empty).unwrap();
    file.put(1, &small).unwrap();
    file.put(2, &exact).unwrap();
    file.put(3, &large).unwrap();

    assert_eq!(file.get(0).unwrap().unwrap(), empty);
    assert_eq!(file.get(1).unwrap().unwrap(), small);
    assert_eq!(file.get(2).unwrap().unwrap(), exact);
    assert_eq!(file.get(3).unwrap().unwrap(), large);
    assert_eq!(file.get(4).unwrap(), None);
}

#[test]
fn test_sectored_same_size_rewrite_in_place() {
    let (_temp, path) = setup_temp_file("s.pdbe");
    let file = SectoredFile::open(&path).unwrap();

    file.put(5, &[1u8; 100]).unwrap();
    let sectors = file.total_sectors();
    file.put(5, &[2u8; 200]).unwrap();

    assert_eq!(file.total_sectors(), sectors);
    assert_eq!(file.get(5).unwrap().unwrap(), vec![2u8; 200]);
}

#[test]
fn test_sectored_reuses_freed_sectors() {
    let (_temp, path) = setup_temp_file("s.pdbe");
    let file = SectoredFile::open(&path).unwrap();

    file.put(1, &[1u8; 10]).unwrap();
    file.put(2, &[2u8; 10]).unwrap();
    let sectors = file.total_sectors();

    assert!(file.remove(1).unwrap());
    file.put(3, &[3u8; 10]).unwrap();

    assert_eq!(file.total_sectors(), sectors);
    assert_eq!(file.get(2).unwrap().unwrap(), vec![2u8; 10]);
    assert_eq!(file.get(3).unwrap().unwrap(), vec![3u8; 10]);
}

#[test]
fn test_sectored_growth_moves_value() {
    let (_temp, path) = setup_temp_file("s.pdbe");
    let file = SectoredFile::open(&path).unwrap();

    file.put(1, &[1u8; 10]).unwrap();
    file.put(2, &[2u8; 10]).unwrap();
    file.put(1, &vec![4u8; 2 * SECTOR_BYTES as usize]).unwrap();

    assert_eq!(file.get(1).unwrap().unwrap(), vec![4u8; 2 * SECTOR_BYTES as usize]);
    assert_eq!(file.get(2).unwrap().unwrap(), vec![2u8; 10]);
}

#[test]
fn test_sectored_persists_across_reopen() {
    let (_temp, path) = setup_temp_file("s.pdbe");
    {
        let file = SectoredFile::open(&path).unwrap();
        file.put(42, b"durable").unwrap();
        file.close().unwrap();
    }

    let file = SectoredFile::open(&path).unwrap();
    assert_eq!(file.get(42).unwrap().unwrap(), b"durable");
    assert_eq!(file.present_slots().unwrap(), vec![42]);
}

#[test]
fn test_sectored_pads_misaligned_file() {
    let (_temp, path) = setup_temp_file("s.pdbe");
    {
        let file = SectoredFile::open(&path).unwrap();
        file.put(0, b"keep me").unwrap();
        file.close().unwrap();
    }

    let raw = OpenOptions::new().write(true).open(&path).unwrap();
    let len = raw.metadata().unwrap().len();
    raw.set_len(len + 100).unwrap();
    drop(raw);

    let file = SectoredFile::open(&path).unwrap();
    assert_eq!(file.get(0).unwrap().unwrap(), b"keep me");
    file.close().unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len % SECTOR_BYTES, 0);
}

// =============================================================================
// OpenFile Tests
// =============================================================================

#[test]
fn test_open_file_creates_parent_directories() {
    let (temp, _) = setup_temp_file("unused");
    let path = temp.path().join("ab").join("cdef.pdbe");

    let file = OpenFile::open(&path, None).unwrap();
    file.put(1, b"v").unwrap();

    assert!(path.exists());
    assert_eq!(file.path(), path.as_path());
}

#[test]
fn test_open_file_selects_variant() {
    let (temp, _) = setup_temp_file("unused");

    let constant = OpenFile::open(&temp.path().join("c"), Some(2)).unwrap();
    assert!(matches!(
        constant.put(0, b"abc"),
        Err(DbError::SizeMismatch { .. })
    ));

    let sectored = OpenFile::open(&temp.path().join("s"), None).unwrap();
    sectored.put(0, b"abc").unwrap();
    assert_eq!(sectored.get(0).unwrap().unwrap(), b"abc");
}

#[test]
fn test_open_file_starts_closable() {
    let (temp, _) = setup_temp_file("unused");
    let file = OpenFile::open(&temp.path().join("x"), None).unwrap();

    assert_eq!(file.loaded_entries(), 0);
    assert!(file.can_close());
}
