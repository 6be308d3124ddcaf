//! Redis-backed bloom tier
//!
//! Bits live in one Redis hash per cache, `<prefix><cacheName>`, with the
//! decimal bit index as the field name and `"1"` as the value. The format
//! is deliberately language-portable: any client that can compute the same
//! double-hash positions can share the filter.

use std::sync::Arc;

use crate::error::CacheError;
use crate::traits::RedisClient;

/// Remote hash tier shared across instances
pub struct RemoteBloomTier {
    redis: Arc<dyn RedisClient>,
    key_prefix: String,
}

impl RemoteBloomTier {
    #[must_use]
    pub fn new(redis: Arc<dyn RedisClient>, key_prefix: String) -> Self {
        Self { redis, key_prefix }
    }

    fn hash_key(&self, cache: &str) -> String {
        format!("{}{cache}", self.key_prefix)
    }

    /// Persist the given bit positions.
    ///
    /// # Errors
    ///
    /// Propagates Redis failures; the composition layer logs and continues.
    pub async fn set(&self, cache: &str, positions: &[u64]) -> Result<(), CacheError> {
        let key = self.hash_key(cache);
        for &pos in positions {
            self.redis.hset(&key, &pos.to_string(), "1").await?;
        }
        Ok(())
    }

    /// Whether every given bit position is present.
    ///
    /// # Errors
    ///
    /// Propagates Redis failures; the composition layer fails open.
    pub async fn test(&self, cache: &str, positions: &[u64]) -> Result<bool, CacheError> {
        let key = self.hash_key(cache);
        for &pos in positions {
            if self.redis.hget(&key, &pos.to_string()).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete the whole hash for a cache.
    ///
    /// # Errors
    ///
    /// Propagates Redis failures.
    pub async fn clear(&self, cache: &str) -> Result<(), CacheError> {
        self.redis.del(&self.hash_key(cache)).await?;
        Ok(())
    }
}
