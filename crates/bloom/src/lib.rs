// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Bit-level math for the URL dedup layer (spec §4.3): sizing, hashing and
//! the underlying bit-vector operations. [`DedupBloom`] wraps these into the
//! bulk-only, occupancy-tracking surface the frontier manager is allowed to
//! call; the authoritative bits for a running cluster live in the shared
//! datastore (see `datastore::bloom_ops`), which mirrors the same hash
//! construction over Redis `SETBIT`/`GETBIT` pipelines so every process
//! agrees on bit positions without sharing process memory.

use bitvec::vec::BitVec;

pub fn combine_u64s(nums: [u64; 2]) -> u128 {
    ((nums[0] as u128) << 64) | (nums[1] as u128)
}

pub fn split_u128(num: u128) -> [u64; 2] {
    [(num >> 64) as u64, num as u64]
}

const XXH3_SECRET: &[u8] = &xxhash_rust::const_xxh3::const_custom_default_secret(42);

pub fn fast_stable_hash_64(t: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64_with_secret(t, XXH3_SECRET)
}

pub fn fast_stable_hash_128(t: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128_with_secret(t, XXH3_SECRET)
}

const LARGE_PRIME: u64 = 11400714819323198549;

/// Number of bits needed for a bloom filter sized for `estimated_items` at
/// false-positive rate `fp`.
#[inline]
pub fn num_bits(estimated_items: u64, fp: f64) -> u64 {
    ((estimated_items as f64) * fp.ln() / (-8.0 * 2.0_f64.ln().powi(2))).ceil() as u64
}

/// Number of hash functions needed given a bit count and expected item count.
#[inline]
pub fn num_hashes(num_bits: u64, estimated_items: u64) -> u64 {
    (((num_bits as f64) / estimated_items as f64 * 2.0_f64.ln()).ceil() as u64).max(1)
}

/// Every bit position a single item's universal-hash family touches, given a
/// filter of `bit_len` bits and `num_hashes` hash functions. Exposed so the
/// datastore adapter can translate a URL straight into Redis bit offsets
/// without duplicating the hash construction.
pub fn bit_positions(item: &[u8], num_hashes: u64, bit_len: u64) -> Vec<u64> {
    let [a, b] = split_u128(fast_stable_hash_128(item));
    (0..num_hashes)
        .map(|i| ((a.wrapping_mul(i).wrapping_add(b)) % LARGE_PRIME) % bit_len)
        .collect()
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct U64BloomFilter {
    #[serde(with = "serde_bitvec")]
    bit_vec: BitVec,
}

impl U64BloomFilter {
    pub fn new(estimated_items: u64, fp: f64) -> Self {
        let bits = num_bits(estimated_items, fp);
        Self {
            bit_vec: BitVec::repeat(false, bits as usize),
        }
    }

    pub fn empty_from(other: &Self) -> Self {
        Self {
            bit_vec: BitVec::repeat(false, other.bit_vec.len()),
        }
    }

    fn hash(item: u64) -> usize {
        item.wrapping_mul(LARGE_PRIME) as usize
    }

    pub fn insert(&mut self, item: u64) {
        let h = Self::hash(item);
        let num_bits = self.bit_vec.len();
        self.bit_vec.set(h % num_bits, true);
    }

    pub fn contains(&self, item: u64) -> bool {
        let h = Self::hash(item);
        self.bit_vec[h % self.bit_vec.len()]
    }

    pub fn estimate_card(&self) -> u64 {
        let num_ones = self.bit_vec.count_ones() as u64;

        if num_ones == 0 || self.bit_vec.is_empty() {
            return 0;
        }

        if num_ones == self.bit_vec.len() as u64 {
            return u64::MAX;
        }

        (-(self.bit_vec.len() as f64) * (1.0 - (num_ones as f64) / (self.bit_vec.len() as f64)).ln())
            as u64
    }

    pub fn union(&mut self, other: Self) {
        debug_assert_eq!(self.bit_vec.len(), other.bit_vec.len());
        self.bit_vec |= other.bit_vec;
    }

    pub fn occupancy(&self) -> f64 {
        if self.bit_vec.is_empty() {
            return 0.0;
        }
        self.bit_vec.count_ones() as f64 / self.bit_vec.len() as f64
    }
}

#[derive(Debug)]
pub struct BytesBloomFilter<T> {
    bit_vec: BitVec,
    num_hashes: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T> BytesBloomFilter<T> {
    pub fn new(estimated_items: u64, fp: f64) -> Self {
        let bits = num_bits(estimated_items, fp);
        let hashes = num_hashes(bits, estimated_items);
        Self {
            bit_vec: BitVec::repeat(false, bits as usize),
            num_hashes: hashes,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn num_hashes(&self) -> u64 {
        self.num_hashes
    }

    pub fn num_bits(&self) -> u64 {
        self.bit_vec.len() as u64
    }

    pub fn contains_raw(&self, item: &[u8]) -> bool {
        bit_positions(item, self.num_hashes, self.bit_vec.len() as u64)
            .into_iter()
            .all(|h| self.bit_vec[h as usize])
    }

    pub fn insert_raw(&mut self, item: &[u8]) {
        for h in bit_positions(item, self.num_hashes, self.bit_vec.len() as u64) {
            self.bit_vec.set(h as usize, true);
        }
    }

    pub fn occupancy(&self) -> f64 {
        if self.bit_vec.is_empty() {
            return 0.0;
        }
        self.bit_vec.count_ones() as f64 / self.bit_vec.len() as f64
    }
}

impl<T> BytesBloomFilter<T>
where
    T: AsRef<[u8]>,
{
    pub fn insert(&mut self, item: &T) {
        self.insert_raw(item.as_ref())
    }

    pub fn contains(&self, item: &T) -> bool {
        self.contains_raw(item.as_ref())
    }
}

/// The bulk-only surface the frontier manager is allowed to call (spec
/// §4.3): `contains_many`/`add_many`, never a per-URL call. This in-process
/// variant is used by tests and single-process runs; the production
/// datastore-backed path lives in `datastore::bloom_ops` and shares the
/// sizing/hashing functions above so both agree on bit layout.
pub struct DedupBloom {
    inner: BytesBloomFilter<Vec<u8>>,
    capacity: u64,
    warned_half_full: std::sync::atomic::AtomicBool,
}

impl DedupBloom {
    pub fn new(capacity: u64, fpr: f64) -> Self {
        Self {
            inner: BytesBloomFilter::new(capacity, fpr),
            capacity,
            warned_half_full: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Probably-seen mask for each input, in order. `true` = probably seen.
    pub fn contains_many(&self, urls: &[impl AsRef<[u8]>]) -> Vec<bool> {
        urls.iter().map(|u| self.inner.contains_raw(u.as_ref())).collect()
    }

    /// Marks every URL as seen.
    pub fn add_many(&mut self, urls: &[impl AsRef<[u8]>]) {
        for u in urls {
            self.inner.insert_raw(u.as_ref());
        }
        self.maybe_warn_occupancy();
    }

    fn maybe_warn_occupancy(&self) {
        let occ = self.inner.occupancy();
        if occ > 0.5 && !self.warned_half_full.swap(true, std::sync::atomic::Ordering::Relaxed) {
            tracing::warn!(
                occupancy = occ,
                capacity = self.capacity,
                "dedup bloom filter occupancy exceeds half of nominal capacity; false-positive rate is rising"
            );
        }
    }

    pub fn occupancy(&self) -> f64 {
        self.inner.occupancy()
    }
}

mod serde_bitvec {
    use bitvec::vec::BitVec;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bv: &BitVec, s: S) -> Result<S::Ok, S::Error> {
        let bytes: Vec<u8> = bv.as_raw_slice().iter().flat_map(|w| w.to_ne_bytes()).collect();
        (bv.len(), bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BitVec, D::Error> {
        let (len, bytes): (usize, Vec<u8>) = Deserialize::deserialize(d)?;
        let word_size = std::mem::size_of::<usize>();
        let words: Vec<usize> = bytes
            .chunks(word_size)
            .map(|c| {
                let mut buf = [0u8; std::mem::size_of::<usize>()];
                buf[..c.len()].copy_from_slice(c);
                usize::from_ne_bytes(buf)
            })
            .collect();
        let mut bv = BitVec::from_vec(words);
        bv.truncate(len);
        Ok(bv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter() {
        let mut bf = U64BloomFilter::new(100, 0.01);
        bf.insert(1);
        bf.insert(2);
        bf.insert(3);

        assert!(bf.contains(1));
        assert!(bf.contains(2));
        assert!(bf.contains(3));
        assert!(!bf.contains(9999));
    }

    #[test]
    fn test_bloom_filter_bytes() {
        let mut bf = BytesBloomFilter::new(100, 0.01);
        bf.insert(&1u64.to_be_bytes().to_vec());
        bf.insert(&2u64.to_be_bytes().to_vec());

        assert!(bf.contains(&1u64.to_be_bytes().to_vec()));
        assert!(bf.contains(&2u64.to_be_bytes().to_vec()));
        assert!(!bf.contains(&9999u64.to_be_bytes().to_vec()));
    }

    #[test]
    fn split_combine_u128() {
        for num in 0..10000_u128 {
            assert_eq!(combine_u64s(split_u128(num)), num);
        }
    }

    #[test]
    fn dedup_bloom_contains_many_matches_individual_add_many() {
        let mut d = DedupBloom::new(1000, 0.01);
        let urls = vec![b"http://a.example/1".to_vec(), b"http://a.example/2".to_vec()];
        let before = d.contains_many(&urls);
        assert_eq!(before, vec![false, false]);

        d.add_many(&urls);
        let after = d.contains_many(&urls);
        assert_eq!(after, vec![true, true]);
    }

    #[test]
    fn dedup_bloom_add_many_is_idempotent_l2() {
        let mut d1 = DedupBloom::new(1000, 0.01);
        let mut d2 = DedupBloom::new(1000, 0.01);
        let url = vec![b"http://a.example/x".to_vec()];
        let dup = vec![
            b"http://a.example/x".to_vec(),
            b"http://a.example/x".to_vec(),
            b"http://a.example/x".to_vec(),
        ];

        d1.add_many(&url);
        d2.add_many(&dup);

        assert_eq!(d1.contains_many(&url), d2.contains_many(&url));
    }

    #[test]
    fn warns_once_past_half_capacity() {
        let mut d = DedupBloom::new(100, 0.1);
        let items: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_be_bytes().to_vec()).collect();
        d.add_many(&items);
        assert!(d.occupancy() > 0.5);
    }

    #[test]
    fn serde_round_trip_preserves_membership() {
        let mut bf = U64BloomFilter::new(100, 0.01);
        bf.insert(42);
        let encoded = serde_json::to_vec(&bf).unwrap();
        let decoded: U64BloomFilter = serde_json::from_slice(&encoded).unwrap();
        assert!(decoded.contains(42));
    }

    proptest::proptest! {
        #[test]
        fn bit_positions_within_range(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..64), hashes in 1u64..8, bits in 8u64..4096) {
            for p in bit_positions(&bytes, hashes, bits) {
                proptest::prop_assert!(p < bits);
            }
        }
    }
}
