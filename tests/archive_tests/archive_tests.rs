//! Tests for the archive backend
//!
//! These tests verify:
//! - Archive member round-trip, compression and checksums
//! - Recovery from a truncated tail record
//! - ArchiveFileManager semantics and lock GC
//! - Shutdown draining and reopen recovery

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use porkdb::file::Archive;
use porkdb::{ArchiveFileManager, Compression, Config, DbError, DigestHasher, FileManager, HashedKey};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_archive(compression: Compression) -> (TempDir, PathBuf, Archive) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.pdba");
    let archive = Archive::open(&path, compression).unwrap();
    (temp_dir, path, archive)
}

fn archive_config(path: &PathBuf, max_locks: usize) -> Config {
    Config::builder()
        .data_dir(path)
        .max_open_files(max_locks)
        .build()
}

fn setup_manager(max_locks: usize) -> (TempDir, PathBuf, ArchiveFileManager) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("archive");
    let manager = ArchiveFileManager::new(&archive_config(&path, max_locks));
    manager.init().unwrap();
    (temp_dir, path, manager)
}

fn key(name: &str) -> HashedKey {
    HashedKey::of::<str>(&DigestHasher::default(), name).unwrap()
}

// =============================================================================
// Archive Tests
// =============================================================================

#[test]
fn test_archive_round_trip() {
    let (_temp, _path, archive) = setup_archive(Compression::None);

    archive.put("first", b"hello").unwrap();
    archive.put("second", b"world").unwrap();

    assert_eq!(archive.fetch("first").unwrap().unwrap().as_ref(), b"hello");
    assert_eq!(archive.fetch("second").unwrap().unwrap().as_ref(), b"world");
    assert!(archive.fetch("third").unwrap().is_none());
    assert_eq!(archive.len(), 2);
}

#[test]
fn test_archive_overwrite_in_place() {
    let (_temp, _path, archive) = setup_archive(Compression::None);

    archive.put("m", &[1u8; 64]).unwrap();
    let end = archive.file_len();
    archive.put("m", &[2u8; 32]).unwrap();

    assert_eq!(archive.file_len(), end);
    assert_eq!(archive.fetch("m").unwrap().unwrap().as_ref(), &[2u8; 32]);
}

#[test]
fn test_archive_deflate_members() {
    let (_temp, path, archive) = setup_archive(Compression::Deflate(6));
    let value = vec![b'z'; 16 * 1024];

    archive.put("big", &value).unwrap();
    archive.sync().unwrap();

    assert!(std::fs::metadata(&path).unwrap().len() < value.len() as u64);
    assert_eq!(archive.fetch("big").unwrap().unwrap().as_ref(), value.as_slice());
}

#[test]
fn test_archive_persists_and_reopens() {
    let (_temp, path, archive) = setup_archive(Compression::None);
    archive.put("a", b"1").unwrap();
    archive.put("b", b"2").unwrap();
    archive.remove("a").unwrap();
    archive.close().unwrap();

    let archive = Archive::open(&path, Compression::None).unwrap();
    let names: HashSet<String> = archive.names().unwrap().into_iter().collect();
    assert_eq!(names, HashSet::from(["b".to_string()]));
    assert_eq!(archive.free_records(), 1);
}

#[test]
fn test_archive_truncates_partial_tail() {
    let (_temp, path, archive) = setup_archive(Compression::None);
    archive.put("whole", b"intact").unwrap();
    let good_len = archive.file_len();
    archive.close().unwrap();

    // Half a record header
    let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
    raw.write_all(&[1, 0, 4, 0, 9, 9]).unwrap();
    drop(raw);

    let archive = Archive::open(&path, Compression::None).unwrap();
    assert_eq!(archive.fetch("whole").unwrap().unwrap().as_ref(), b"intact");
    assert_eq!(archive.file_len(), good_len);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
}

#[test]
fn test_archive_detects_corruption() {
    let (_temp, path, archive) = setup_archive(Compression::None);
    archive.put("x", b"checksummed").unwrap();
    archive.close().unwrap();

    // Flip the last data byte
    let len = std::fs::metadata(&path).unwrap().len();
    let raw = OpenOptions::new().write(true).open(&path).unwrap();
    {
        use std::io::{Seek, SeekFrom};
        let mut raw = &raw;
        raw.seek(SeekFrom::Start(len - 1)).unwrap();
        raw.write_all(b"?").unwrap();
    }
    drop(raw);

    let archive = Archive::open(&path, Compression::None).unwrap();
    assert!(matches!(archive.fetch("x"), Err(DbError::Corrupt(_))));
}

#[test]
fn test_archive_rejects_foreign_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.pdba");
    std::fs::write(&path, b"NOTANARCHIVE").unwrap();

    assert!(matches!(
        Archive::open(&path, Compression::None),
        Err(DbError::Corrupt(_))
    ));
}

// =============================================================================
// ArchiveFileManager Tests
// =============================================================================

#[test]
fn test_manager_round_trip_and_absence() {
    let (_temp, path, manager) = setup_manager(16);

    manager.put(&key("a"), b"alpha").unwrap();
    assert_eq!(manager.get(&key("a")).unwrap().unwrap(), b"alpha");
    assert_eq!(manager.get(&key("b")).unwrap(), None);
    assert!(!manager.contains(&key("b")).unwrap());
    assert!(manager.archive_path().starts_with(&path));
}

#[test]
fn test_manager_remove_is_idempotent() {
    let (_temp, _path, manager) = setup_manager(16);

    manager.put(&key("r"), b"x").unwrap();
    assert!(manager.remove(&key("r")).unwrap());
    assert!(!manager.remove(&key("r")).unwrap());
}

#[test]
fn test_manager_lock_budget() {
    let (_temp, _path, manager) = setup_manager(4);

    for i in 0..50 {
        manager.put(&key(&format!("k{}", i)), b"v").unwrap();
        assert!(manager.lock_count() <= 4);
    }
}

#[test]
fn test_manager_concurrent_puts() {
    let (_temp, _path, manager) = setup_manager(8);
    let manager = Arc::new(manager);
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..40 {
                    let name = format!("{}:{}", t, i);
                    manager.put(&key(&name), name.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..threads {
        for i in 0..40 {
            let name = format!("{}:{}", t, i);
            assert_eq!(manager.get(&key(&name)).unwrap().unwrap(), name.as_bytes());
        }
    }
}

#[test]
fn test_manager_for_each_reconstructs_hashes() {
    let (_temp, _path, manager) = setup_manager(16);
    let mut expected = HashSet::new();
    for i in 0..20 {
        let k = key(&format!("item{}", i));
        manager.put(&k, b"v").unwrap();
        expected.insert(k.hash().to_vec());
    }

    let mut seen = HashSet::new();
    manager
        .for_each(&mut |hash, value| {
            assert_eq!(value.as_ref(), b"v");
            seen.insert(hash.to_vec());
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, expected);
}

#[test]
fn test_manager_shutdown_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("archive");
    {
        let manager = ArchiveFileManager::new(&archive_config(&path, 4));
        manager.init().unwrap();
        for i in 0..30 {
            manager.put(&key(&format!("p{}", i)), &[i as u8; 10]).unwrap();
        }
        manager.shutdown(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(manager.lock_count(), 0);
        assert!(matches!(
            manager.get(&key("p1")),
            Err(DbError::AlreadyClosed(_))
        ));
        assert!(matches!(
            manager.for_each(&mut |_, _| Ok(())),
            Err(DbError::AlreadyClosed(_))
        ));
        assert!(matches!(manager.init(), Err(DbError::AlreadyClosed(_))));
        assert!(matches!(
            manager.shutdown(None),
            Err(DbError::AlreadyClosed(_))
        ));
    }

    let manager = ArchiveFileManager::new(&archive_config(&path, 4));
    manager.init().unwrap();
    for i in 0..30 {
        assert_eq!(
            manager.get(&key(&format!("p{}", i))).unwrap().unwrap(),
            vec![i as u8; 10]
        );
    }
}

#[test]
fn test_manager_shutdown_resumes_after_timeout() {
    let (_temp, _path, manager) = setup_manager(8);
    manager.put(&key("held"), b"value").unwrap();
    let manager = Arc::new(manager);
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let visitor = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            manager.for_each(&mut |_, _| {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
        })
    };

    entered_rx.recv().unwrap();
    assert!(matches!(
        manager.shutdown(Some(Duration::from_millis(20))),
        Err(DbError::ShutdownTimeout { remaining: 1 })
    ));
    assert!(matches!(
        manager.get(&key("held")),
        Err(DbError::AlreadyClosed(_))
    ));

    release_tx.send(()).unwrap();
    visitor.join().unwrap().unwrap();

    manager.shutdown(None).unwrap();
    assert_eq!(manager.lock_count(), 0);
    assert!(matches!(
        manager.shutdown(None),
        Err(DbError::AlreadyClosed(_))
    ));
}

#[test]
fn test_manager_compressed_archive() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .archive_compression(Compression::Deflate(9))
        .build();
    let manager = ArchiveFileManager::new(&config);
    manager.init().unwrap();

    let value = vec![3u8; 10_000];
    manager.put(&key("c"), &value).unwrap();
    assert_eq!(manager.get(&key("c")).unwrap().unwrap(), value);
}
