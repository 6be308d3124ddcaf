//! Envelope store
//!
//! The one place that reads and writes envelopes against Redis. Both the
//! writer chain's storage handler and the breakdown guard's write-through
//! go through here, so version bumping and decode-failure eviction behave
//! identically on every path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::ValueEnvelope;
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::traits::{Clock, Codec, RedisClient};

/// Envelope read/write around the injected Redis client
pub struct EnvelopeStore {
    redis: Arc<dyn RedisClient>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
}

impl EnvelopeStore {
    #[must_use]
    pub fn new(redis: Arc<dyn RedisClient>, codec: Arc<dyn Codec>, clock: Arc<dyn Clock>) -> Self {
        Self { redis, codec, clock }
    }

    /// Read and decode the envelope for a key.
    ///
    /// A decode failure evicts the offending key and surfaces as
    /// [`CacheError::Serialization`]; the caller decides whether that
    /// degrades to a miss.
    ///
    /// # Errors
    ///
    /// Redis failures and decode failures.
    pub async fn read(&self, key: &CacheKey) -> Result<Option<ValueEnvelope>, CacheError> {
        let storage_key = key.storage_key();
        let Some(bytes) = self.redis.get(&storage_key).await? else {
            return Ok(None);
        };
        match self.codec.decode(&bytes) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "undecodable envelope; evicting");
                let _ = self.redis.del(&storage_key).await;
                Err(CacheError::Serialization {
                    key: storage_key,
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Write a value envelope, bumping the version past any existing entry.
    ///
    /// # Errors
    ///
    /// Redis and encode failures.
    pub async fn write(
        &self,
        key: &CacheKey,
        value: Value,
        type_name: &str,
        ttl_seconds: u64,
    ) -> Result<ValueEnvelope, CacheError> {
        self.write_payload(key, value, type_name, ttl_seconds).await
    }

    /// Write the null marker, bumping the version past any existing entry.
    ///
    /// # Errors
    ///
    /// Redis and encode failures.
    pub async fn write_null(
        &self,
        key: &CacheKey,
        ttl_seconds: u64,
    ) -> Result<ValueEnvelope, CacheError> {
        self.write_payload(
            key,
            Value::Null,
            crate::envelope::NULL_MARKER_TYPE,
            ttl_seconds,
        )
        .await
    }

    async fn write_payload(
        &self,
        key: &CacheKey,
        value: Value,
        type_name: &str,
        ttl_seconds: u64,
    ) -> Result<ValueEnvelope, CacheError> {
        let now = self.clock.now_millis();
        // Prior version is best-effort: an undecodable predecessor already
        // got evicted by read() and restarts the version sequence.
        let prior = self.read(key).await.ok().flatten();
        let envelope = match prior {
            Some(previous) => previous.next_version(value, type_name, ttl_seconds, now),
            None => ValueEnvelope::new(value, type_name, ttl_seconds, now),
        };
        self.persist(key, &envelope).await?;
        debug!(key = %key, version = envelope.version, ttl = envelope.ttl, "envelope written");
        Ok(envelope)
    }

    /// Write only when the key is absent. Returns whether the write won.
    ///
    /// # Errors
    ///
    /// Redis and encode failures.
    pub async fn write_if_absent(
        &self,
        key: &CacheKey,
        value: Value,
        type_name: &str,
        ttl_seconds: u64,
    ) -> Result<bool, CacheError> {
        let envelope = ValueEnvelope::new(value, type_name, ttl_seconds, self.clock.now_millis());
        let bytes = self.codec.encode(&envelope)?;
        let ttl = envelope.storage_ttl_seconds().map(Duration::from_secs);
        self.redis
            .set_if_absent(&key.storage_key(), &bytes, ttl)
            .await
    }

    /// Persist a read bump (visit counter + access stamp), preserving the
    /// key's remaining expiry. Best-effort: races with writers are settled
    /// by version on the next read.
    pub async fn touch(&self, key: &CacheKey, envelope: &mut ValueEnvelope) {
        envelope.touch(self.clock.now_millis());
        let storage_key = key.storage_key();
        let remaining = match self.redis.pttl(&storage_key).await {
            Ok(ms) if ms > 0 => Some(Duration::from_millis(u64::try_from(ms).unwrap_or(0))),
            Ok(-1) => None,
            Ok(_) => return, // key vanished meanwhile
            Err(e) => {
                debug!(key = %storage_key, error = %e, "touch skipped");
                return;
            }
        };
        match self.codec.encode(envelope) {
            Ok(bytes) => {
                if let Err(e) = self.redis.set(&storage_key, &bytes, remaining).await {
                    debug!(key = %storage_key, error = %e, "touch write failed");
                }
            }
            Err(e) => debug!(key = %storage_key, error = %e, "touch encode failed"),
        }
    }

    async fn persist(&self, key: &CacheKey, envelope: &ValueEnvelope) -> Result<(), CacheError> {
        let bytes = self.codec.encode(envelope)?;
        let ttl = envelope.storage_ttl_seconds().map(Duration::from_secs);
        self.redis.set(&key.storage_key(), &bytes, ttl).await
    }

    /// Delete one entry. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Redis failures.
    pub async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.redis.del(&key.storage_key()).await
    }

    /// Delete every entry of a cache. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Redis failures.
    pub async fn delete_all(&self, cache: &str) -> Result<u64, CacheError> {
        let keys = self.redis.scan(&CacheKey::cache_pattern(cache)).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.redis.del_many(&keys).await?;
        debug!(cache = %cache, count = removed, "cache cleaned");
        Ok(removed)
    }
}
