//! Reversible hashers for primitive integers.
//!
//! The "hash" is the little-endian encoding of the value, so it is
//! collision-free and the key can be rebuilt from it.

use super::KeyHasher;

/// Hashes integers to their little-endian bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimitiveKeyHasher;

macro_rules! impl_primitive_hasher {
    ($($ty:ty),*) => {
        $(
            impl KeyHasher<$ty> for PrimitiveKeyHasher {
                fn hash(&self, key: &$ty) -> Vec<u8> {
                    key.to_le_bytes().to_vec()
                }

                fn hash_length(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                fn reconstruct(&self, hash: &[u8]) -> Option<$ty> {
                    Some(<$ty>::from_le_bytes(hash.try_into().ok()?))
                }
            }
        )*
    };
}

impl_primitive_hasher!(u8, u16, u32, u64, i16, i32, i64);
