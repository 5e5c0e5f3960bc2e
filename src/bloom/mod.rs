//! Bloom filter with a fixed family of six hash functions.
//!
//! Each SSTable data block carries one of these filters in its meta
//! block, so the bit layout and the hash family are part of the on-disk
//! format and are owned by this crate rather than delegated to an
//! external filter implementation.
//!
//! # Sizing
//!
//! For `n` expected insertions and false-positive probability `fpp`:
//!
//! - bit-array length `m = ceil(-n·ln(fpp) / (ln 2)²)`, rounded up to
//!   whole bytes;
//! - hash count `k = max(1, floor((m/n)·ln 2))`, clamped to the six
//!   available hash functions.
//!
//! # Concurrency
//!
//! `add` serializes writers behind a mutex. `query` reads the bit array
//! lock-free: bits are only ever set, never cleared, so a concurrent
//! reader observes a monotonically-growing set and can never produce a
//! false negative for a completed `add`.

#[cfg(test)]
mod tests;

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use thiserror::Error;
use tracing::trace;

use crate::encoding::{Decode, Encode, EncodingError};

/// Number of hash functions available to a filter.
pub const MAX_HASH_FUNCS: usize = 6;

/// Errors returned by bloom-filter construction.
#[derive(Debug, Error)]
pub enum BloomError {
    /// `fpp` outside `(0, 1)` or non-positive expected insertions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Encoding / decoding error for a serialized filter.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// A probabilistic "key might be present" set.
pub struct BloomFilter {
    /// Serializes `add` calls; queries do not take it.
    write_lock: Mutex<()>,

    /// Number of keys inserted so far.
    element_num: AtomicU64,

    /// The bit array, byte-addressed. Bits are set with relaxed
    /// `fetch_or` and never cleared.
    bits: Vec<AtomicU8>,

    /// Length of the bit array in bits (`m`).
    bit_len: u64,

    /// Number of hash functions in use (`k`).
    hash_num: usize,
}

/// A 63-bit string hash. The six members of the family are combined by
/// indexing, not chaining, so each key sets `k` independent bits.
type HashFn = fn(&[u8]) -> u64;

const HASH_FUNCS: [HashFn; MAX_HASH_FUNCS] =
    [rs_hash, bkdr_hash, djb_hash, js_hash, sdbm_hash, adler_hash];

const MASK_63: u64 = 0x7FFF_FFFF_FFFF_FFFF;

fn rs_hash(key: &[u8]) -> u64 {
    let mut a: u64 = 63689;
    let b: u64 = 378551;
    let mut hash: u64 = 0;
    for &byte in key {
        hash = hash.wrapping_mul(a).wrapping_add(u64::from(byte));
        a = a.wrapping_mul(b);
    }
    hash & MASK_63
}

fn bkdr_hash(key: &[u8]) -> u64 {
    let seed: u64 = 131313;
    let mut hash: u64 = 0;
    for &byte in key {
        hash = hash.wrapping_mul(seed).wrapping_add(u64::from(byte));
    }
    hash & MASK_63
}

fn djb_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &byte in key {
        hash = (hash << 5)
            .wrapping_add(hash)
            .wrapping_add(u64::from(byte));
    }
    hash & MASK_63
}

fn js_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 1315423911;
    for &byte in key {
        hash ^= (hash << 5)
            .wrapping_add(u64::from(byte))
            .wrapping_add(hash >> 2);
    }
    hash & MASK_63
}

fn sdbm_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 0;
    for &byte in key {
        hash = hash.wrapping_mul(65599).wrapping_add(u64::from(byte));
    }
    hash & MASK_63
}

fn adler_hash(key: &[u8]) -> u64 {
    let mut s1: u64 = 1;
    let mut s2: u64 = 0;
    for &byte in key {
        s1 = s1.wrapping_add(u64::from(byte));
        s2 = s2.wrapping_add(s1);
    }
    s2.wrapping_mul(65536).wrapping_add(s1) & MASK_63
}

impl BloomFilter {
    /// Creates a filter sized for `expected_insertions` keys at the given
    /// false-positive probability.
    ///
    /// # Errors
    ///
    /// [`BloomError::InvalidArgument`] when `fpp` is outside `(0, 1)` or
    /// `expected_insertions` is not positive.
    pub fn new(fpp: f64, expected_insertions: i64) -> Result<Self, BloomError> {
        if !(fpp > 0.0 && fpp < 1.0) {
            return Err(BloomError::InvalidArgument(format!(
                "false positive probability must be in (0, 1), got {fpp}"
            )));
        }
        if expected_insertions <= 0 {
            return Err(BloomError::InvalidArgument(format!(
                "expected insertions must be positive, got {expected_insertions}"
            )));
        }

        let bit_len = Self::optimal_bit_len(fpp, expected_insertions);
        let byte_len = (bit_len as usize).div_ceil(8).max(1);
        let hash_num = Self::optimal_hash_num(bit_len, expected_insertions);

        let mut bits = Vec::with_capacity(byte_len);
        bits.resize_with(byte_len, || AtomicU8::new(0));

        trace!(bit_len, hash_num, "bloom filter created");

        Ok(Self {
            write_lock: Mutex::new(()),
            element_num: AtomicU64::new(0),
            bits,
            bit_len,
            hash_num,
        })
    }

    /// `m = ceil(-n·ln(fpp) / (ln 2)²)`.
    fn optimal_bit_len(fpp: f64, expected_insertions: i64) -> u64 {
        let n = expected_insertions as f64;
        let m = (-n * fpp.ln()) / (std::f64::consts::LN_2 * std::f64::consts::LN_2);
        (m.ceil() as u64).max(1)
    }

    /// `k = max(1, floor((m/n)·ln 2))`, clamped to the hash family size.
    fn optimal_hash_num(bit_len: u64, expected_insertions: i64) -> usize {
        let ratio = bit_len as f64 / expected_insertions as f64;
        let k = (ratio * std::f64::consts::LN_2).floor() as usize;
        k.clamp(1, MAX_HASH_FUNCS)
    }

    /// Maps `key` through the first `hash_num` members of the hash family.
    fn positions<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = u64> + 'a {
        HASH_FUNCS[..self.hash_num]
            .iter()
            .map(move |f| f(key) % self.bit_len)
    }

    /// Inserts a key, setting `k` bits.
    pub fn add(&self, key: &[u8]) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.element_num.fetch_add(1, Ordering::Relaxed);
        for site in self.positions(key) {
            let byte = (site >> 3) as usize;
            let bit = (site & 0x07) as u32;
            self.bits[byte].fetch_or(0x80u8 >> bit, Ordering::Relaxed);
        }
    }

    /// Returns `true` iff all `k` bits for `key` are set.
    ///
    /// Never returns `false` for a key whose `add` has completed.
    pub fn query(&self, key: &[u8]) -> bool {
        self.positions(key).all(|site| {
            let byte = (site >> 3) as usize;
            let bit = (site & 0x07) as u32;
            self.bits[byte].load(Ordering::Relaxed) & (0x80u8 >> bit) != 0
        })
    }

    /// Number of keys inserted so far.
    pub fn element_num(&self) -> u64 {
        self.element_num.load(Ordering::Relaxed)
    }

    /// Length of the bit array in bits.
    pub fn bit_len(&self) -> u64 {
        self.bit_len
    }

    /// Number of hash functions in use.
    pub fn hash_num(&self) -> usize {
        self.hash_num
    }

    /// Copies the filter state into its on-disk representation.
    pub fn to_serialized(&self) -> SerializedFilter {
        SerializedFilter {
            key_num: self.element_num.load(Ordering::Relaxed),
            bit_map: self
                .bits
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            bit_map_len: self.bit_len,
            hash_num: self.hash_num as u32,
        }
    }
}

/// On-disk form of a bloom filter as stored inside an SSTable meta
/// block: `(key_num, bit_map, bit_map_len, hash_num)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedFilter {
    /// Number of keys the filter was built from.
    pub key_num: u64,

    /// The raw bit array.
    pub bit_map: Vec<u8>,

    /// Bit-array length in bits.
    pub bit_map_len: u64,

    /// Number of hash functions used.
    pub hash_num: u32,
}

impl SerializedFilter {
    /// Queries a serialized filter without rehydrating a [`BloomFilter`].
    pub fn query(&self, key: &[u8]) -> bool {
        if self.bit_map_len == 0 {
            return true;
        }
        HASH_FUNCS[..(self.hash_num as usize).min(MAX_HASH_FUNCS)]
            .iter()
            .all(|f| {
                let site = f(key) % self.bit_map_len;
                let byte = (site >> 3) as usize;
                let bit = (site & 0x07) as u32;
                byte < self.bit_map.len() && self.bit_map[byte] & (0x80u8 >> bit) != 0
            })
    }
}

impl Encode for SerializedFilter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key_num.encode_to(buf)?;
        self.bit_map.encode_to(buf)?;
        self.bit_map_len.encode_to(buf)?;
        self.hash_num.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SerializedFilter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key_num, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (bit_map, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (bit_map_len, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (hash_num, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                key_num,
                bit_map,
                bit_map_len,
                hash_num,
            },
            off,
        ))
    }
}

/// Encoded byte length of a serialized filter: key_num(8) +
/// len-prefix(4) + bit_map + bit_map_len(8) + hash_num(4).
pub(crate) fn serialized_len(filter: &SerializedFilter) -> usize {
    8 + 4 + filter.bit_map.len() + 8 + 4
}

/// Convenience wrapper used by code that only needs the two sizing
/// formulas (e.g. tests validating `(m, k)` derivation).
pub fn optimal_params(fpp: f64, expected_insertions: i64) -> Result<(u64, usize), BloomError> {
    let filter = BloomFilter::new(fpp, expected_insertions)?;
    Ok((filter.bit_len(), filter.hash_num()))
}
