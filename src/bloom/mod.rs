//! Two-tier bloom filter
//!
//! Probabilistic membership that short-circuits definite-miss lookups
//! before they reach Redis or the origin. The local bitset answers most
//! checks without a round-trip; on a local miss the Redis-backed tier is
//! consulted, and a remote hit warms the local bits.
//!
//! Failure policy: membership checks fail open — a broken filter must never
//! manufacture a false miss. Failed `add`s are logged and ignored; the
//! worst case is a future stampede through, not a correctness loss.

mod local;
mod remote;

pub use local::LocalBloomTier;
pub use remote::RemoteBloomTier;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::BloomConfig;
use crate::traits::RedisClient;

/// Counters for one filter instance
#[derive(Debug, Default)]
pub struct BloomStats {
    pub adds: AtomicU64,
    pub rejections: AtomicU64,
    pub fail_opens: AtomicU64,
}

/// Snapshot of [`BloomStats`]
#[derive(Debug, Clone, Copy)]
pub struct BloomStatsSnapshot {
    pub adds: u64,
    pub rejections: u64,
    pub fail_opens: u64,
}

impl BloomStats {
    fn snapshot(&self) -> BloomStatsSnapshot {
        BloomStatsSnapshot {
            adds: self.adds.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            fail_opens: self.fail_opens.load(Ordering::Relaxed),
        }
    }
}

/// Hierarchical bloom filter: local bitset in front of a Redis hash
///
/// `add` always writes both tiers; `clear` clears both. A key that was ever
/// added keeps answering `true` until an explicit `clear(cache)`.
pub struct BloomFilter {
    config: BloomConfig,
    local: LocalBloomTier,
    remote: RemoteBloomTier,
    stats: BloomStats,
}

impl BloomFilter {
    #[must_use]
    pub fn new(config: BloomConfig, redis: Arc<dyn RedisClient>) -> Self {
        let bit_size = config.bit_size.max(1);
        Self {
            local: LocalBloomTier::new(bit_size),
            remote: RemoteBloomTier::new(redis, config.key_prefix.clone()),
            config: BloomConfig { bit_size, ..config },
            stats: BloomStats::default(),
        }
    }

    /// Record a key in both tiers.
    ///
    /// Remote failures are logged and swallowed; the local tier alone still
    /// prevents false misses on this instance.
    pub async fn add(&self, cache: &str, key: &str) {
        let positions = self.positions(key);
        self.local.set(cache, &positions);
        if let Err(e) = self.remote.set(cache, &positions).await {
            warn!(cache = %cache, key = %key, error = %e, "bloom add failed on the remote tier");
        }
        self.stats.adds.fetch_add(1, Ordering::Relaxed);
    }

    /// Membership check. `false` means the key was definitely never added.
    ///
    /// A remote hit warms the local bits so the next check stays
    /// in-process. Any error fails open.
    pub async fn might_contain(&self, cache: &str, key: &str) -> bool {
        let positions = self.positions(key);
        if self.local.test(cache, &positions) {
            return true;
        }
        match self.remote.test(cache, &positions).await {
            Ok(true) => {
                self.local.set(cache, &positions);
                true
            }
            Ok(false) => {
                self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(e) => {
                warn!(cache = %cache, key = %key, error = %e, "bloom check failed; failing open");
                self.stats.fail_opens.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Drop all recorded keys for a cache, both tiers.
    pub async fn clear(&self, cache: &str) {
        self.local.clear(cache);
        if let Err(e) = self.remote.clear(cache).await {
            warn!(cache = %cache, error = %e, "bloom clear failed on the remote tier");
        }
        debug!(cache = %cache, "bloom filter cleared");
    }

    #[must_use]
    pub fn stats(&self) -> BloomStatsSnapshot {
        self.stats.snapshot()
    }

    /// Bit positions for a key: double hashing over a SHA-256 digest.
    ///
    /// The two seed hashes come from the first 16 digest bytes, so positions
    /// are stable across processes and languages; `h2` is forced odd to keep
    /// the k probes distinct. All positions are reduced modulo the bit size.
    fn positions(&self, key: &str) -> Vec<u64> {
        let digest = Sha256::digest(key.as_bytes());
        let h1 = u64::from_le_bytes(digest[0..8].try_into().unwrap_or([0; 8]));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().unwrap_or([0; 8])) | 1;
        (0..u64::from(self.config.hash_functions.max(1)))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.config.bit_size)
            .collect()
    }
}
