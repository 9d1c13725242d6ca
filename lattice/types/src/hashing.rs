// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io::Cursor;

/// Seed used for every key lookup on the consistent-hash ring. Hash points are
/// seeded by their point index instead, so a key and a point never collide by
/// construction.
pub const HASH_MAGIC_SEED: u32 = 0x0100_0193;

/// A 128-bit hash value, compared lexicographically as `(h1, h2)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash128 {
    pub h1: u64,
    pub h2: u64,
}

impl Hash128 {
    pub const ZERO: Hash128 = Hash128 { h1: 0, h2: 0 };
}

/// MurmurHash3 x64-128 of `buf` under `seed`.
pub fn hash128(buf: &[u8], seed: u32) -> Hash128 {
    // Reading from an in-memory cursor cannot fail.
    let value = murmur3::murmur3_x64_128(&mut Cursor::new(buf), seed)
        .expect("murmur3 over an in-memory buffer");
    Hash128 {
        h1: value as u64,
        h2: (value >> 64) as u64,
    }
}

/// Folds `v` into `seed` with the Boost `hash_combine` 64-bit mixer.
pub fn hash_combine_u64(seed: &mut u64, v: u64) {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut v = v.wrapping_mul(M);
    v ^= v >> R;
    v = v.wrapping_mul(M);

    *seed ^= v;
    *seed = seed.wrapping_mul(M);
    // Arbitrary constant, keeps 0 from hashing to 0.
    *seed = seed.wrapping_add(0xe654_6b64);
}

/// Hashes `buf` (seeded by the low half of the accumulator) and folds the two
/// halves into the accumulator independently.
pub fn hash_combine_bytes(acc: &mut Hash128, buf: &[u8]) {
    let value = hash128(buf, acc.h1 as u32);
    hash_combine_u64(&mut acc.h1, value.h1);
    hash_combine_u64(&mut acc.h2, value.h2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash128_is_deterministic() {
        let a = hash128(b"node-1", HASH_MAGIC_SEED);
        let b = hash128(b"node-1", HASH_MAGIC_SEED);
        assert_eq!(a, b);
        assert_ne!(a, hash128(b"node-2", HASH_MAGIC_SEED));
        assert_ne!(a, hash128(b"node-1", HASH_MAGIC_SEED + 1));
    }

    #[test]
    fn combine_depends_on_order() {
        let mut forward = Hash128::ZERO;
        hash_combine_bytes(&mut forward, b"alpha");
        hash_combine_bytes(&mut forward, b"beta");

        let mut reversed = Hash128::ZERO;
        hash_combine_bytes(&mut reversed, b"beta");
        hash_combine_bytes(&mut reversed, b"alpha");

        assert_ne!(forward, reversed);
    }

    #[test]
    fn combine_never_leaves_zero() {
        let mut seed = 0u64;
        hash_combine_u64(&mut seed, 0);
        assert_ne!(seed, 0);
    }
}
