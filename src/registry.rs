//! Invocation registry
//!
//! Bounded `(cacheName, key) → CachedInvocation` directory. An invocation
//! records how to re-load one cached entry from its origin, so the
//! pre-refresh executor can refresh entries long after the original caller
//! is gone. Entries are evicted when idle (default 30 minutes); the keyed
//! lock lookup delegates to the lock pool so a key's invocation and its
//! lock share a lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::CacheError;
use crate::key::{CacheKey, KeySource};
use crate::lock::{LockPool, LockReference};
use crate::operation::CacheOperation;
use crate::traits::{Clock, Loader};

/// Normalized key for "all entries" evictions.
pub const WILDCARD_KEY: &str = "*";

/// Origin loader descriptor for one `(cache, key)` pair
pub struct CachedInvocation {
    pub key: CacheKey,
    pub operation: Arc<CacheOperation>,
    pub loader: Arc<dyn Loader>,
    /// Invocation facts from the binding layer, when available.
    pub source: Option<KeySource>,
    pub created_ms: i64,
    last_load_ms: AtomicI64,
}

impl CachedInvocation {
    #[must_use]
    pub fn new(
        key: CacheKey,
        operation: Arc<CacheOperation>,
        loader: Arc<dyn Loader>,
        source: Option<KeySource>,
        now_ms: i64,
    ) -> Self {
        Self {
            key,
            operation,
            loader,
            source,
            created_ms: now_ms,
            last_load_ms: AtomicI64::new(now_ms),
        }
    }

    /// Stamp a successful origin load.
    pub fn record_load(&self, now_ms: i64) {
        self.last_load_ms.store(now_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_load_ms(&self) -> i64 {
        self.last_load_ms.load(Ordering::Relaxed)
    }
}

/// Normalize an evict key: absent means every entry of the cache.
#[must_use]
pub fn normalize_evict_key(key: Option<&str>) -> &str {
    key.unwrap_or(WILDCARD_KEY)
}

/// Bounded, idle-evicting invocation directory for one cache
pub struct InvocationRegistry {
    invocations: Cache<String, Arc<CachedInvocation>>,
    pool: Arc<LockPool>,
    clock: Arc<dyn Clock>,
}

impl InvocationRegistry {
    #[must_use]
    pub fn new(config: &RegistryConfig, pool: Arc<LockPool>, clock: Arc<dyn Clock>) -> Self {
        let invocations = Cache::builder()
            .max_capacity(config.effective_capacity())
            .time_to_idle(Duration::from_millis(config.invocation_max_idle_time_ms))
            .build();
        Self {
            invocations,
            pool,
            clock,
        }
    }

    /// Register (or refresh) the invocation behind a cacheable entry.
    ///
    /// # Errors
    ///
    /// Cacheable registrations need an explicit key; blank keys are
    /// rejected.
    pub async fn register(
        &self,
        key: CacheKey,
        operation: Arc<CacheOperation>,
        loader: Arc<dyn Loader>,
        source: Option<KeySource>,
    ) -> Result<Arc<CachedInvocation>, CacheError> {
        if key.rendered().trim().is_empty() || key.rendered() == WILDCARD_KEY {
            return Err(CacheError::ConfigurationInvalid {
                cache: key.cache_name().to_string(),
                reason: "cacheable registrations require an explicit, non-wildcard key".to_string(),
            });
        }
        let invocation = Arc::new(CachedInvocation::new(
            key.clone(),
            operation,
            loader,
            source,
            self.clock.now_millis(),
        ));
        self.invocations
            .insert(key.storage_key(), invocation.clone())
            .await;
        Ok(invocation)
    }

    /// Resolve the invocation for a key, touching its idle timer.
    pub async fn resolve(&self, key: &CacheKey) -> Option<Arc<CachedInvocation>> {
        self.invocations.get(&key.storage_key()).await
    }

    /// Drop the invocation for a key (or all of them on the wildcard).
    pub async fn forget(&self, key: &CacheKey) {
        if key.rendered() == WILDCARD_KEY {
            self.invocations.invalidate_all();
        } else {
            self.invocations.invalidate(&key.storage_key()).await;
        }
    }

    /// Keyed lock lookup for a cache entry.
    #[must_use]
    pub fn lock_for(&self, key: &CacheKey) -> Arc<LockReference> {
        self.pool.reference(&key.storage_key())
    }

    /// Run moka's deferred maintenance (idle eviction happens here).
    pub async fn sweep(&self) {
        self.invocations.run_pending_tasks().await;
        debug!(entries = self.invocations.entry_count(), "invocation registry swept");
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.invocations.entry_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
