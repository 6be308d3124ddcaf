//! In-process bloom tier
//!
//! One bit vector per cache name, allocated lazily on first touch. Bit
//! operations are guarded by a per-cache-name mutex; the map of vectors is
//! a concurrent map so unrelated caches never contend.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

const BITS_PER_WORD: u64 = 64;

/// Local bitset tier, keyed by cache name
pub struct LocalBloomTier {
    bit_size: u64,
    bits: DashMap<String, Arc<Mutex<Vec<u64>>>>,
}

impl LocalBloomTier {
    #[must_use]
    pub fn new(bit_size: u64) -> Self {
        Self {
            bit_size: bit_size.max(1),
            bits: DashMap::new(),
        }
    }

    fn vector(&self, cache: &str) -> Arc<Mutex<Vec<u64>>> {
        self.bits
            .entry(cache.to_string())
            .or_insert_with(|| {
                let words = usize::try_from(self.bit_size.div_ceil(BITS_PER_WORD))
                    .unwrap_or(usize::MAX);
                Arc::new(Mutex::new(vec![0u64; words]))
            })
            .clone()
    }

    /// Set the given bit positions for a cache.
    pub fn set(&self, cache: &str, positions: &[u64]) {
        let vector = self.vector(cache);
        let mut words = vector.lock();
        for &pos in positions {
            let word = usize::try_from(pos / BITS_PER_WORD).unwrap_or(0);
            if let Some(slot) = words.get_mut(word) {
                *slot |= 1u64 << (pos % BITS_PER_WORD);
            }
        }
    }

    /// Whether every given bit position is set for a cache.
    ///
    /// A cache with no vector yet answers `false` (nothing was ever added
    /// through this instance).
    #[must_use]
    pub fn test(&self, cache: &str, positions: &[u64]) -> bool {
        let Some(vector) = self.bits.get(cache).map(|v| v.clone()) else {
            return false;
        };
        let words = vector.lock();
        positions.iter().all(|&pos| {
            let word = usize::try_from(pos / BITS_PER_WORD).unwrap_or(0);
            words
                .get(word)
                .is_some_and(|slot| slot & (1u64 << (pos % BITS_PER_WORD)) != 0)
        })
    }

    /// Drop the vector for a cache.
    pub fn clear(&self, cache: &str) {
        self.bits.remove(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_test() {
        let tier = LocalBloomTier::new(256);
        tier.set("users", &[1, 63, 64, 255]);
        assert!(tier.test("users", &[1, 63, 64, 255]));
        assert!(tier.test("users", &[64]));
        assert!(!tier.test("users", &[2]));
        assert!(!tier.test("users", &[1, 2]));
    }

    #[test]
    fn unknown_cache_answers_false() {
        let tier = LocalBloomTier::new(256);
        assert!(!tier.test("nobody", &[0]));
    }

    #[test]
    fn clear_forgets_everything() {
        let tier = LocalBloomTier::new(256);
        tier.set("users", &[7]);
        tier.clear("users");
        assert!(!tier.test("users", &[7]));
    }
}
