//! Tests for the Store facade
//!
//! These tests verify:
//! - Identical behaviour on the tree and archive backends
//! - Compression handling and its fallbacks
//! - Key reconstruction for reversible hashers
//! - Shutdown and reopen

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use porkdb::{
    Backend, Compression, Config, DbError, DigestHasher, KeyHasher, PrimitiveKeyHasher, Store,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const BACKENDS: [Backend; 2] = [Backend::Tree, Backend::Archive];

fn store_config(temp_dir: &TempDir, backend: Backend) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .backend(backend)
        .max_open_files(8)
        .shutdown_timeout(Duration::from_secs(5))
        .build()
}

fn str_store(config: &Config) -> Store<str> {
    Store::open(config, Arc::new(DigestHasher::default())).unwrap()
}

// =============================================================================
// Basic Operation Tests
// =============================================================================

#[test]
fn test_round_trip_on_every_backend() {
    for backend in BACKENDS {
        let temp_dir = TempDir::new().unwrap();
        let store = str_store(&store_config(&temp_dir, backend));

        store.put("name", b"porkdb").unwrap();
        assert_eq!(store.get("name").unwrap().unwrap(), b"porkdb", "{:?}", backend);
        assert!(store.contains("name").unwrap());
        assert_eq!(store.get("other").unwrap(), None);

        assert!(store.remove("name").unwrap());
        assert!(!store.remove("name").unwrap());
        assert!(!store.contains("name").unwrap());
    }
}

#[test]
fn test_for_each_on_every_backend() {
    for backend in BACKENDS {
        let temp_dir = TempDir::new().unwrap();
        let store = str_store(&store_config(&temp_dir, backend));
        for i in 0..25 {
            store.put(&format!("k{}", i), format!("v{}", i).as_bytes()).unwrap();
        }

        let mut values = HashSet::new();
        store
            .for_each(|hash, value| {
                assert_eq!(hash.len(), 16);
                values.insert(String::from_utf8(value).unwrap());
                Ok(())
            })
            .unwrap();

        let expected: HashSet<String> = (0..25).map(|i| format!("v{}", i)).collect();
        assert_eq!(values, expected, "{:?}", backend);
    }
}

#[test]
fn test_configured_hash_length_reaches_store() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .hash_length(8)
        .build();
    let store: Store<str> =
        Store::open(&config, Arc::new(DigestHasher::from_config(&config).unwrap())).unwrap();
    store.put("k", b"v").unwrap();

    let mut lengths = Vec::new();
    store
        .for_each(|hash, _| {
            lengths.push(hash.len());
            Ok(())
        })
        .unwrap();
    assert_eq!(lengths, vec![8]);
}

#[test]
fn test_short_hasher_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = store_config(&temp_dir, Backend::Tree);
    let result = Store::<str>::open(&config, Arc::new(DigestHasher::new(1).unwrap()));

    assert!(matches!(result, Err(DbError::InvalidConfig(_))));
}

// =============================================================================
// Compression Tests
// =============================================================================

#[test]
fn test_compressed_values_on_every_backend() {
    for backend in BACKENDS {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::builder()
            .data_dir(temp_dir.path())
            .backend(backend)
            .compression(Compression::Deflate(6))
            .build();
        let store = str_store(&config);
        let value = vec![b'q'; 20_000];

        store.put("z", &value).unwrap();
        assert_eq!(store.get("z").unwrap().unwrap(), value, "{:?}", backend);
    }
}

#[test]
fn test_compression_ignored_for_constant_values() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .value_size(8)
        .compression(Compression::Deflate(9))
        .build();
    let store = str_store(&config);

    // Stored raw, so the fixed size check still sees 8 bytes
    store.put("fixed", &[5u8; 8]).unwrap();
    assert_eq!(store.get("fixed").unwrap().unwrap(), vec![5u8; 8]);
    assert!(matches!(
        store.put("fixed", &[5u8; 9]),
        Err(DbError::SizeMismatch { .. })
    ));
}

// =============================================================================
// Key Reconstruction Tests
// =============================================================================

#[test]
fn test_keys_with_reversible_hasher() {
    for backend in BACKENDS {
        let temp_dir = TempDir::new().unwrap();
        let store: Store<u32> = Store::open(
            &store_config(&temp_dir, backend),
            Arc::new(PrimitiveKeyHasher),
        )
        .unwrap();

        let expected: HashSet<u32> = [1, 255, 256, 70_000, u32::MAX].into_iter().collect();
        for key in &expected {
            store.put(key, &key.to_be_bytes()).unwrap();
        }

        let keys: HashSet<u32> = store.keys().unwrap().into_iter().collect();
        assert_eq!(keys, expected, "{:?}", backend);
    }
}

#[test]
fn test_keys_with_digest_hasher_fails() {
    let temp_dir = TempDir::new().unwrap();
    let hasher: Arc<dyn KeyHasher<String>> = Arc::new(DigestHasher::default());
    let store: Store<String> = Store::open(&store_config(&temp_dir, Backend::Tree), hasher).unwrap();
    store.put(&"k".to_string(), b"v").unwrap();

    assert!(matches!(store.keys(), Err(DbError::InvalidArgument(_))));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_shutdown_and_reopen_on_every_backend() {
    for backend in BACKENDS {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = str_store(&store_config(&temp_dir, backend));
            for i in 0..40 {
                store.put(&format!("key{}", i), &[i as u8; 3]).unwrap();
            }
            store.shutdown().unwrap();
            assert!(store.get("key1").is_err());
        }

        let store = str_store(&store_config(&temp_dir, backend));
        for i in 0..40 {
            assert_eq!(
                store.get(&format!("key{}", i)).unwrap().unwrap(),
                vec![i as u8; 3],
                "{:?}",
                backend
            );
        }
    }
}
