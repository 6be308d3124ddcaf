//! Breakdown guard — triple-checked loading
//!
//! Coalesces a thundering herd of concurrent misses on one key into a
//! single origin call. Three checks, one per locking tier:
//!
//! 1. read the cache with no lock held;
//! 2. acquire the process-local keyed lock, re-read;
//! 3. acquire the distributed lock, re-read;
//!
//! and only on a still-miss invoke the loader exactly once, write through,
//! and return. Both re-reads exist because either lock acquisition can race
//! with a completing loader holding the other tier.
//!
//! Lock timeouts fall through to the origin *without* write-through, so a
//! wedged lock degrades to uncoordinated loads instead of failing reads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::envelope::ValueEnvelope;
use crate::error::CacheError;
use crate::events::{CacheEvent, CacheEventKind, EventPublisher};
use crate::key::CacheKey;
use crate::lock::LockPool;
use crate::operation::CacheOperation;
use crate::store::EnvelopeStore;
use crate::traits::{Clock, DistributedLock, Loader};
use crate::ttl::TtlPolicy;

/// Lease granted to the distributed lock around one origin load.
const LOAD_LEASE: Duration = Duration::from_secs(30);

/// Ceiling for null-marker TTLs, seconds.
const NULL_TTL_CAP: u64 = 60;

/// Outcome of a guarded load
#[derive(Debug)]
pub enum GuardOutcome {
    /// An envelope is in the cache (freshly written or found on re-read).
    Envelope(ValueEnvelope),
    /// Lock timeout fall-through: the origin was called but nothing was
    /// written to the cache.
    Uncached(Option<Value>),
}

/// Triple-check load path around a single origin call
pub struct BreakdownGuard {
    pool: Arc<LockPool>,
    dist: Arc<dyn DistributedLock>,
    store: Arc<EnvelopeStore>,
    policy: Arc<TtlPolicy>,
    bloom: Arc<BloomFilter>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    local_timeout: Duration,
}

impl BreakdownGuard {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<LockPool>,
        dist: Arc<dyn DistributedLock>,
        store: Arc<EnvelopeStore>,
        policy: Arc<TtlPolicy>,
        bloom: Arc<BloomFilter>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        local_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            dist,
            store,
            policy,
            bloom,
            events,
            clock,
            local_timeout,
        }
    }

    /// Guarded read-through: return a live envelope, loading on miss.
    ///
    /// An existing envelope satisfies the load unless it is past its TTL.
    ///
    /// # Errors
    ///
    /// Loader failures and write-through failures; a loader null without
    /// null caching is [`CacheError::NullLoaderResult`].
    pub async fn load_through(
        &self,
        key: &CacheKey,
        op: &CacheOperation,
        loader: &dyn Loader,
    ) -> Result<GuardOutcome, CacheError> {
        let policy = self.policy.clone();
        self.load_with(key, op, loader, move |env| {
            !policy.is_expired(env.created_time, env.storage_ttl_seconds().unwrap_or(0))
        })
        .await
    }

    /// Guarded refresh: reload even though the entry is still live.
    ///
    /// The checks treat the entry as satisfied only when someone else
    /// already wrote a version newer than `observed_version`, which is what
    /// keeps cluster-wide pre-refreshes single-flight.
    ///
    /// # Errors
    ///
    /// See [`Self::load_through`].
    pub async fn refresh(
        &self,
        key: &CacheKey,
        op: &CacheOperation,
        loader: &dyn Loader,
        observed_version: u64,
    ) -> Result<GuardOutcome, CacheError> {
        self.load_with(key, op, loader, move |env| env.version > observed_version)
            .await
    }

    async fn load_with(
        &self,
        key: &CacheKey,
        op: &CacheOperation,
        loader: &dyn Loader,
        satisfied: impl Fn(&ValueEnvelope) -> bool,
    ) -> Result<GuardOutcome, CacheError> {
        // Check 1: no lock.
        if let Some(env) = self.read_satisfied(key, &satisfied).await {
            return Ok(GuardOutcome::Envelope(env));
        }

        // Check 2: local lock.
        let local = match self.pool.try_acquire(&key.storage_key(), self.local_timeout).await {
            Ok(handle) => handle,
            Err(CacheError::LockTimeout { .. }) => {
                warn!(key = %key, "local lock timed out; loading without write-through");
                return self.fall_through(key, loader).await;
            }
            Err(e) => return Err(e),
        };
        if let Some(env) = self.read_satisfied(key, &satisfied).await {
            drop(local);
            return Ok(GuardOutcome::Envelope(env));
        }

        // Check 3: distributed lock, when the operation asks for one.
        let result = if op.distributed_lock {
            let lock_name = distributed_lock_name(op, key);
            let acquired = match self
                .dist
                .try_lock(&lock_name, self.local_timeout, LOAD_LEASE)
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!(key = %key, error = %e, "distributed lock unavailable; loading without write-through");
                    drop(local);
                    return self.fall_through(key, loader).await;
                }
            };
            if !acquired {
                warn!(key = %key, "distributed lock timed out; loading without write-through");
                drop(local);
                return self.fall_through(key, loader).await;
            }

            let inner = match self.read_satisfied(key, &satisfied).await {
                Some(env) => Ok(GuardOutcome::Envelope(env)),
                None => self.invoke_and_store(key, op, loader).await,
            };
            // Distributed lock releases before the local one.
            if let Err(e) = self.dist.unlock(&lock_name).await {
                warn!(key = %key, error = %e, "distributed unlock failed");
            }
            inner
        } else {
            self.invoke_and_store(key, op, loader).await
        };

        drop(local);
        result
    }

    async fn read_satisfied(
        &self,
        key: &CacheKey,
        satisfied: &impl Fn(&ValueEnvelope) -> bool,
    ) -> Option<ValueEnvelope> {
        match self.store.read(key).await {
            Ok(Some(env)) if satisfied(&env) => Some(env),
            Ok(_) => None,
            Err(e) => {
                debug!(key = %key, error = %e, "guard re-read degraded to miss");
                None
            }
        }
    }

    /// The single origin call plus write-through.
    async fn invoke_and_store(
        &self,
        key: &CacheKey,
        op: &CacheOperation,
        loader: &dyn Loader,
    ) -> Result<GuardOutcome, CacheError> {
        let loaded = loader.load().await.map_err(|e| CacheError::LoaderFailure {
            key: key.storage_key(),
            source: e,
        })?;

        let envelope = match loaded {
            Some(value) => {
                let ttl = self
                    .policy
                    .final_ttl(op.ttl_seconds, op.random_ttl, op.variance);
                self.store.write(key, value, &op.return_type, ttl).await?
            }
            None if op.cache_null_values => {
                self.store.write_null(key, null_ttl(op.ttl_seconds)).await?
            }
            None => {
                return Err(CacheError::NullLoaderResult {
                    key: key.storage_key(),
                });
            }
        };

        if op.use_bloom_filter {
            self.bloom.add(key.cache_name(), key.rendered()).await;
        }
        self.events.publish(
            CacheEvent::new(
                CacheEventKind::CachePut,
                key.cache_name(),
                self.clock.now_millis(),
            )
            .with_key(key.rendered())
            .with_reason("load-through"),
        );
        Ok(GuardOutcome::Envelope(envelope))
    }

    /// Origin call with no coordination and no write-through.
    async fn fall_through(
        &self,
        key: &CacheKey,
        loader: &dyn Loader,
    ) -> Result<GuardOutcome, CacheError> {
        let value = loader.load().await.map_err(|e| CacheError::LoaderFailure {
            key: key.storage_key(),
            source: e,
        })?;
        Ok(GuardOutcome::Uncached(value))
    }
}

/// Logical distributed lock name for an operation/key pair.
///
/// The configured name scopes the lock; the rendered key makes exclusivity
/// per hot key rather than per cache.
fn distributed_lock_name(op: &CacheOperation, key: &CacheKey) -> String {
    let base = op.distributed_lock_name.as_deref().unwrap_or("cache");
    format!("{base}:{}", key.rendered())
}

fn null_ttl(op_ttl: u64) -> u64 {
    if op_ttl == 0 {
        NULL_TTL_CAP
    } else {
        op_ttl.min(NULL_TTL_CAP)
    }
}
