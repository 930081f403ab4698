//! Bloom filter over normalized field values, targeting ~1%
//! false-positive rate with FNV-1a + DJB2 hashes. Zero false negatives,
//! ~1% false positives by default; false positives manifest downstream
//! as an empty lookup inside an admitted chunk.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn djb2(data: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in data {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

impl BloomFilter {
    /// Sizes the filter for `expected_items` entries at `fp_rate`,
    /// following the standard optimal-size formulas.
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = fp_rate.clamp(0.0001, 0.5);
        let m = (-(n * p.ln()) / (std::f64::consts::LN_2.powi(2))).ceil().max(64.0);
        let k = ((m / n) * std::f64::consts::LN_2).round().clamp(1.0, 16.0);
        let num_bits = m as usize;
        let words = num_bits.div_ceil(64);
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes: k as u32,
        }
    }

    fn positions(&self, value: &str) -> impl Iterator<Item = usize> + '_ {
        let h1 = fnv1a(value.as_bytes());
        let h2 = djb2(value.as_bytes());
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % self.num_bits as u64) as usize
        })
    }

    pub fn insert(&mut self, value: &str) {
        for pos in self.positions(value).collect::<Vec<_>>() {
            self.bits[pos / 64] |= 1 << (pos % 64);
        }
    }

    /// Returns `true` if `value` may be present. `false` is a certain
    /// negative; `true` may be a false positive.
    pub fn admits(&self, value: &str) -> bool {
        self.positions(value).all(|pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_false_negative() {
        let mut bf = BloomFilter::new(50, 0.01);
        let values: Vec<String> = (0..50).map(|i| format!("value-{i}")).collect();
        for v in &values {
            bf.insert(v);
        }
        for v in &values {
            assert!(bf.admits(v), "bloom filter must never false-negative");
        }
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let mut bf = BloomFilter::new(200, 0.01);
        for i in 0..200 {
            bf.insert(&format!("present-{i}"));
        }
        let false_positives = (0..5000)
            .filter(|i| bf.admits(&format!("absent-{i}")))
            .count();
        // Loose bound: well under 10% even though we target 1%, to keep
        // this test stable across hash distributions.
        assert!(false_positives < 500, "got {false_positives} false positives out of 5000");
    }
}
