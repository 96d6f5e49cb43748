//! Tests for key hashers
//!
//! These tests verify:
//! - Digest output is deterministic and of the configured length
//! - Invalid digest lengths are rejected
//! - Hashers built from a Config follow its hash_length
//! - Primitive hashers are reversible
//! - HashedKey routing fields

use porkdb::{Config, DbError, DigestHasher, HashedKey, KeyHasher, PrimitiveKeyHasher};

// =============================================================================
// DigestHasher Tests
// =============================================================================

#[test]
fn test_digest_is_deterministic() {
    let hasher = DigestHasher::new(16).unwrap();
    let a = KeyHasher::<str>::hash(&hasher, "apple");
    let b = KeyHasher::<str>::hash(&hasher, "apple");
    let c = KeyHasher::<str>::hash(&hasher, "banana");

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 16);
}

#[test]
fn test_digest_length_matches_config() {
    for len in [1usize, 2, 8, 31, 32] {
        let hasher = DigestHasher::new(len).unwrap();
        assert_eq!(KeyHasher::<[u8]>::hash_length(&hasher), len);
        assert_eq!(KeyHasher::<[u8]>::hash(&hasher, b"key").len(), len);
    }
}

#[test]
fn test_digest_from_config_uses_hash_length() {
    let config = Config::builder().hash_length(24).build();
    let hasher = DigestHasher::from_config(&config).unwrap();
    assert_eq!(KeyHasher::<str>::hash_length(&hasher), 24);
    assert_eq!(KeyHasher::<str>::hash(&hasher, "k").len(), 24);

    let default = DigestHasher::from_config(&Config::default()).unwrap();
    assert_eq!(KeyHasher::<str>::hash_length(&default), 16);

    let bad = Config::builder().hash_length(40).build();
    assert!(matches!(
        DigestHasher::from_config(&bad),
        Err(DbError::InvalidConfig(_))
    ));
}

#[test]
fn test_digest_truncates_full_hash() {
    let short = DigestHasher::new(4).unwrap();
    let full = DigestHasher::new(32).unwrap();
    let key = "prefix-check";

    let short_hash = KeyHasher::<str>::hash(&short, key);
    let full_hash = KeyHasher::<str>::hash(&full, key);
    assert_eq!(&full_hash[..4], short_hash.as_slice());
}

#[test]
fn test_digest_rejects_bad_length() {
    assert!(matches!(DigestHasher::new(0), Err(DbError::InvalidConfig(_))));
    assert!(matches!(DigestHasher::new(33), Err(DbError::InvalidConfig(_))));
}

#[test]
fn test_digest_cannot_reconstruct() {
    let hasher = DigestHasher::default();
    let hash = KeyHasher::<Vec<u8>>::hash(&hasher, &b"k".to_vec());
    assert!(KeyHasher::<Vec<u8>>::reconstruct(&hasher, &hash).is_none());
}

// =============================================================================
// PrimitiveKeyHasher Tests
// =============================================================================

#[test]
fn test_primitive_u32_little_endian() {
    let hasher = PrimitiveKeyHasher;
    let hash = KeyHasher::<u32>::hash(&hasher, &0x0102_0304);
    assert_eq!(hash, vec![0x04, 0x03, 0x02, 0x01]);
    assert_eq!(KeyHasher::<u32>::hash_length(&hasher), 4);
}

#[test]
fn test_primitive_reconstructs_keys() {
    let hasher = PrimitiveKeyHasher;

    let hash = KeyHasher::<u64>::hash(&hasher, &987_654_321);
    assert_eq!(KeyHasher::<u64>::reconstruct(&hasher, &hash), Some(987_654_321));

    let hash = KeyHasher::<i32>::hash(&hasher, &-42);
    assert_eq!(KeyHasher::<i32>::reconstruct(&hasher, &hash), Some(-42));

    let hash = KeyHasher::<u16>::hash(&hasher, &65_535);
    assert_eq!(KeyHasher::<u16>::reconstruct(&hasher, &hash), Some(65_535));
}

#[test]
fn test_primitive_reconstruct_wrong_length() {
    let hasher = PrimitiveKeyHasher;
    assert_eq!(KeyHasher::<u32>::reconstruct(&hasher, &[1, 2, 3]), None);
}

// =============================================================================
// HashedKey Tests
// =============================================================================

#[test]
fn test_hashed_key_of() {
    let hasher = DigestHasher::new(8).unwrap();
    let key = HashedKey::of::<str>(&hasher, "value").unwrap();

    assert_eq!(key.hash().len(), 8);
    assert_eq!(key.sub_hash(), &key.hash()[..7]);
    assert_eq!(key.slot(), key.hash()[7]);
}

#[test]
fn test_hashed_key_shared_file_shares_route() {
    let a = HashedKey::new(vec![0xAA, 0xBB, 0x01]).unwrap();
    let b = HashedKey::new(vec![0xAA, 0xBB, 0x02]).unwrap();
    let c = HashedKey::new(vec![0xAA, 0xBC, 0x01]).unwrap();

    assert_eq!(a.hash_hash(), b.hash_hash());
    assert_ne!(a.hash_hash(), c.hash_hash());
}

#[test]
fn test_hashed_key_needs_two_bytes() {
    let hasher = PrimitiveKeyHasher;
    assert!(matches!(
        HashedKey::of::<u8>(&hasher, &7),
        Err(DbError::InvalidArgument(_))
    ));
}
