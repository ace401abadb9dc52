//! Approximate-membership filter over buffered tombstones.
//!
//! The mutable buffer consults this filter before scanning for a tombstone,
//! so most negative checks cost two hashes instead of a linear pass. Inserts
//! race with concurrent appenders, so the bit array is atomic.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

const FALSE_POSITIVE_RATE: f64 = 0.01;

/// A bloom filter using double hashing (Kirsch-Mitzenmacher), sized for a
/// fixed capacity at construction.
#[derive(Debug)]
pub struct TombstoneFilter {
    bits: Vec<AtomicU64>,
    num_bits: usize,
    num_hashes: u32,
}

impl TombstoneFilter {
    /// Create a filter sized for `capacity` tombstones.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        // m = -n * ln(p) / (ln2)^2, k = (m/n) * ln2
        let num_bits = (-(capacity as f64) * FALSE_POSITIVE_RATE.ln() / 2.0_f64.ln().powi(2))
            .ceil() as usize;
        let num_bits = num_bits.max(64);
        let num_hashes = ((num_bits as f64 / capacity as f64) * 2.0_f64.ln()).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        let words = num_bits.div_ceil(64);
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, || AtomicU64::new(0));
        Self {
            bits,
            num_bits,
            num_hashes,
        }
    }

    pub fn insert<T: Hash>(&self, item: &T) {
        let (h1, h2) = hash_pair(item);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[idx / 64].fetch_or(1u64 << (idx % 64), Ordering::Relaxed);
        }
    }

    /// Returns `false` if the item is definitely not present.
    pub fn may_contain<T: Hash>(&self, item: &T) -> bool {
        let (h1, h2) = hash_pair(item);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            if self.bits[idx / 64].load(Ordering::Relaxed) & (1u64 << (idx % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Reset the filter. Only legal while no inserts are in flight.
    pub fn clear(&self) {
        for word in &self.bits {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.bits.len() * std::mem::size_of::<AtomicU64>()
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

fn hash_pair<T: Hash>(item: &T) -> (u64, u64) {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    item.hash(&mut hasher);
    let h1 = hasher.finish();
    // Derive the second hash by re-hashing with a fixed prefix.
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    0x9e37_79b9_7f4a_7c15u64.hash(&mut hasher);
    item.hash(&mut hasher);
    (h1, hasher.finish())
}
