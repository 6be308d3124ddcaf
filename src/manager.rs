//! Cache manager
//!
//! Owns the `cacheName → CacheHandle` map, built lazily from the
//! configuration table. Each handle carries its own writer chain, bloom
//! state, lock pool slice and invocation registry partition; the Redis
//! client, codec, clock, events, distributed lock and pre-refresh executor
//! are shared across handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bloom::{BloomFilter, BloomStatsSnapshot};
use crate::config::ShieldConfig;
use crate::error::CacheError;
use crate::events::{CacheEvent, CacheEventKind, EventPublisher};
use crate::guard::{BreakdownGuard, GuardOutcome};
use crate::key::{CacheKey, DefaultKeyGenerator, KeySource};
use crate::lock::{LockPool, LockPoolSnapshot};
use crate::operation::{CacheOperation, CacheOperationBuilder};
use crate::refresh::{RefreshExecutor, RefreshStatsSnapshot};
use crate::registry::InvocationRegistry;
use crate::store::EnvelopeStore;
use crate::strategy::{
    BloomStrategy, FetchContext, FetchStrategy, PreRefreshStrategy, RefreshSubmitter,
    SimpleStrategy, StrategyChain,
};
use crate::traits::{
    Clock, Codec, DistributedLock, ExpressionEvaluator, KeyGenerator, Loader, RedisClient,
};
use crate::ttl::TtlPolicy;
use crate::writer::{
    BloomHandler, CacheOp, CacheResponse, CacheWriter, DoubleDeleteHandler, MissReason,
    NullValueHandler, OpHandler, OpRequest, StorageHandler, SyncLockHandler, TtlHandler,
};

#[derive(Debug, Default)]
struct EngineCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

/// Per-cache statistics
#[derive(Debug, Clone)]
pub struct CacheStatsSnapshot {
    pub name: String,
    pub bloom: BloomStatsSnapshot,
    pub lock_pool: LockPoolSnapshot,
    pub registry_entries: u64,
}

/// Engine-wide statistics
#[derive(Debug, Clone)]
pub struct ShieldStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub refresh: RefreshStatsSnapshot,
    pub caches: Vec<CacheStatsSnapshot>,
}

/// Schedules guarded refreshes for one cache handle.
struct RefreshCoordinator {
    registry: Arc<InvocationRegistry>,
    guard: Arc<BreakdownGuard>,
    executor: Arc<RefreshExecutor>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl RefreshSubmitter for RefreshCoordinator {
    fn submit_refresh(
        &self,
        key: &CacheKey,
        operation: &Arc<CacheOperation>,
        observed_version: u64,
    ) -> bool {
        let registry = self.registry.clone();
        let guard = self.guard.clone();
        let key_owned = key.clone();
        let operation = operation.clone();
        let clock = self.clock.clone();

        let accepted = self.executor.submit(&key.storage_key(), async move {
            let Some(invocation) = registry.resolve(&key_owned).await else {
                debug!(key = %key_owned, "no invocation registered; refresh skipped");
                return Ok(());
            };
            guard
                .refresh(
                    &key_owned,
                    &operation,
                    invocation.loader.as_ref(),
                    observed_version,
                )
                .await?;
            invocation.record_load(clock.now_millis());
            Ok(())
        });

        if accepted {
            self.events.publish(
                CacheEvent::new(
                    CacheEventKind::PreRefreshTriggered,
                    key.cache_name(),
                    self.clock.now_millis(),
                )
                .with_key(key.rendered()),
            );
        }
        accepted
    }
}

/// One cache's pipeline: writer chain, bloom, locks, registry, strategies
pub struct CacheHandle {
    name: String,
    writer: CacheWriter,
    bloom: Arc<BloomFilter>,
    pool: Arc<LockPool>,
    registry: Arc<InvocationRegistry>,
    guard: Arc<BreakdownGuard>,
    strategies: Arc<StrategyChain>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    counters: Arc<EngineCounters>,
}

impl CacheHandle {
    fn hit_event(&self, key: &CacheKey, reason: Option<&str>) {
        let mut event = CacheEvent::new(CacheEventKind::CacheHit, &self.name, self.clock.now_millis())
            .with_key(key.rendered());
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.events.publish(event);
    }

    fn miss_event(&self, key: &CacheKey, reason: &str) {
        self.events.publish(
            CacheEvent::new(CacheEventKind::CacheMiss, &self.name, self.clock.now_millis())
                .with_key(key.rendered())
                .with_reason(reason),
        );
    }

    /// Read without a loader. Misses stay misses.
    ///
    /// # Errors
    ///
    /// Storage failures that cannot degrade to a miss.
    pub async fn get(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
    ) -> Result<Option<Value>, CacheError> {
        let key = CacheKey::new(&self.name, rendered_key);
        let mut req = OpRequest::new(CacheOp::Get, key.clone(), operation.clone());
        let response = self.writer.execute(&mut req).await?;
        self.conclude_read(operation, &key, response, None).await
    }

    /// Read-through: on a confirmed miss the loader runs (guarded when the
    /// operation says so) and the result is written back.
    ///
    /// # Errors
    ///
    /// Loader failures, guarded-load failures, and storage failures.
    pub async fn get_or_load(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
        loader: Arc<dyn Loader>,
    ) -> Result<Option<Value>, CacheError> {
        let key = CacheKey::new(&self.name, rendered_key);
        self.registry
            .register(key.clone(), operation.clone(), loader.clone(), None)
            .await?;

        let mut req = OpRequest::new(CacheOp::Get, key.clone(), operation.clone());
        req.loader = Some(loader.clone());
        let response = self.writer.execute(&mut req).await?;
        self.conclude_read(operation, &key, response, Some(loader)).await
    }

    /// Shared tail of both read paths: strategies, counters, load-on-miss.
    async fn conclude_read(
        &self,
        operation: &Arc<CacheOperation>,
        key: &CacheKey,
        response: CacheResponse,
        loader: Option<Arc<dyn Loader>>,
    ) -> Result<Option<Value>, CacheError> {
        match response {
            CacheResponse::Hit { envelope } => {
                let mut ctx =
                    FetchContext::new(operation.clone(), key.clone(), Some(envelope));
                self.strategies.apply(&mut ctx).await;

                if ctx.force_miss {
                    let observed = ctx.envelope.as_ref().map_or(0, |e| e.version);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.miss_event(key, "pre-refresh-sync");
                    return match loader {
                        Some(loader) => self.reload(operation, key, &loader, observed).await,
                        None => Ok(None),
                    };
                }

                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.hit_event(key, None);
                Ok(ctx.envelope.map(|e| e.value))
            }
            CacheResponse::NullHit => {
                // Cached null: present, answers without the origin.
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.hit_event(key, Some("null"));
                Ok(None)
            }
            CacheResponse::Miss {
                reason: MissReason::BloomRejected,
            } => {
                // Penetration defence: never touch the origin.
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            CacheResponse::Miss { reason } => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.miss_event(key, miss_reason_label(reason));
                match loader {
                    Some(loader) => self.load_and_store(operation, key, &loader).await,
                    None => Ok(None),
                }
            }
            CacheResponse::Loaded { value } => {
                // Fall-through load: served but deliberately not cached.
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            CacheResponse::Stored { .. }
            | CacheResponse::NotStored
            | CacheResponse::Evicted { .. } => Ok(None),
        }
    }

    /// Uncoordinated load for operations with no lock tier enabled.
    ///
    /// Guarded operations never reach this: with a loader attached, the
    /// sync-lock handler owns the whole read and a miss response cannot
    /// come back from the chain.
    async fn load_and_store(
        &self,
        operation: &Arc<CacheOperation>,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
    ) -> Result<Option<Value>, CacheError> {
        let loaded = loader.load().await.map_err(|e| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            self.events.publish(
                CacheEvent::new(CacheEventKind::CacheError, &self.name, self.clock.now_millis())
                    .with_key(key.rendered())
                    .with_reason("loader"),
            );
            CacheError::LoaderFailure {
                key: key.storage_key(),
                source: e,
            }
        })?;

        match loaded {
            Some(value) => {
                self.put(operation, key.rendered(), Some(value.clone())).await?;
                Ok(Some(value))
            }
            None if operation.cache_null_values => {
                self.put(operation, key.rendered(), None).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Guarded reload used by forced (SYNC-mode) pre-refresh misses.
    async fn reload(
        &self,
        operation: &Arc<CacheOperation>,
        key: &CacheKey,
        loader: &Arc<dyn Loader>,
        observed_version: u64,
    ) -> Result<Option<Value>, CacheError> {
        match self
            .guard
            .refresh(key, operation, loader.as_ref(), observed_version)
            .await?
        {
            GuardOutcome::Envelope(env) if env.is_null_marker() => Ok(None),
            GuardOutcome::Envelope(env) => Ok(Some(env.value)),
            GuardOutcome::Uncached(value) => Ok(value),
        }
    }

    /// Write a value (or a null) through the chain.
    ///
    /// # Errors
    ///
    /// Write-path failures propagate.
    pub async fn put(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
        value: Option<Value>,
    ) -> Result<(), CacheError> {
        let key = CacheKey::new(&self.name, rendered_key);
        let mut req = OpRequest::new(CacheOp::Put, key, operation.clone());
        req.value = value;
        let response = self.writer.execute(&mut req).await?;
        if matches!(response, CacheResponse::Stored { .. }) {
            self.counters.puts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Write only when absent. Returns whether the write won.
    ///
    /// # Errors
    ///
    /// Write-path failures propagate.
    pub async fn put_if_absent(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
        value: Option<Value>,
    ) -> Result<bool, CacheError> {
        let key = CacheKey::new(&self.name, rendered_key);
        let mut req = OpRequest::new(CacheOp::PutIfAbsent, key, operation.clone());
        req.value = value;
        let response = self.writer.execute(&mut req).await?;
        let stored = matches!(response, CacheResponse::Stored { .. });
        if stored {
            self.counters.puts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stored)
    }

    /// Remove one entry.
    ///
    /// # Errors
    ///
    /// Storage failures propagate.
    pub async fn evict(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
    ) -> Result<u64, CacheError> {
        let key = CacheKey::new(&self.name, rendered_key);
        let mut req = OpRequest::new(CacheOp::Evict, key.clone(), operation.clone());
        let response = self.writer.execute(&mut req).await?;
        self.registry.forget(&key).await;
        let count = match response {
            CacheResponse::Evicted { count } => count,
            _ => 0,
        };
        self.counters.evictions.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }

    /// Remove every entry of this cache.
    ///
    /// # Errors
    ///
    /// Storage failures propagate.
    pub async fn clean(&self, operation: &Arc<CacheOperation>) -> Result<u64, CacheError> {
        let key = CacheKey::new(&self.name, crate::registry::WILDCARD_KEY);
        let mut req = OpRequest::new(CacheOp::Clean, key.clone(), operation.clone());
        let response = self.writer.execute(&mut req).await?;
        self.registry.forget(&key).await;
        let count = match response {
            CacheResponse::Evicted { count } => count,
            _ => 0,
        };
        self.counters.evictions.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }

    fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            name: self.name.clone(),
            bloom: self.bloom.stats(),
            lock_pool: self.pool.snapshot(),
            registry_entries: self.registry.len(),
        }
    }
}

fn miss_reason_label(reason: MissReason) -> &'static str {
    match reason {
        MissReason::NotFound => "not-found",
        MissReason::BloomRejected => "bloom",
        MissReason::Expired => "expired",
        MissReason::DecodeFailure => "decode",
        MissReason::StorageError => "storage",
    }
}

struct ManagerInner {
    config: ShieldConfig,
    redis: Arc<dyn RedisClient>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
    dist: Arc<dyn DistributedLock>,
    refresh: Arc<RefreshExecutor>,
    custom_strategies: Vec<Arc<dyn FetchStrategy>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    key_generators: std::collections::HashMap<String, Arc<dyn KeyGenerator>>,
    handles: DashMap<String, Arc<CacheHandle>>,
    counters: Arc<EngineCounters>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Engine-wide cache manager
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ShieldConfig,
        redis: Arc<dyn RedisClient>,
        codec: Arc<dyn Codec>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        dist: Arc<dyn DistributedLock>,
        custom_strategies: Vec<Arc<dyn FetchStrategy>>,
        evaluator: Option<Arc<dyn ExpressionEvaluator>>,
        key_generators: std::collections::HashMap<String, Arc<dyn KeyGenerator>>,
    ) -> Self {
        let refresh = Arc::new(RefreshExecutor::new(
            config.refresh.worker_bound(),
            Duration::from_secs(config.refresh.shutdown_grace_secs),
        ));
        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                redis,
                codec,
                clock,
                events,
                dist,
                refresh,
                custom_strategies,
                evaluator,
                key_generators,
                handles: DashMap::new(),
                counters: Arc::new(EngineCounters::default()),
                sweeper: Mutex::new(None),
            }),
        };
        manager.start_maintenance();
        manager
    }

    /// Render the cache key for an invocation.
    ///
    /// Resolution order: the operation's key expression through the
    /// injected evaluator, then a named key generator, then the default
    /// generator that stringifies `(targetType, method, args…)`.
    /// `Ok(None)` means the operation's condition vetoed caching.
    ///
    /// # Errors
    ///
    /// Expression failures surface as [`CacheError::ConfigurationInvalid`].
    pub fn render_key(
        &self,
        operation: &CacheOperation,
        source: &KeySource,
    ) -> Result<Option<String>, CacheError> {
        let as_config_error = |e: anyhow::Error| CacheError::ConfigurationInvalid {
            cache: operation.primary_cache().to_string(),
            reason: e.to_string(),
        };

        if let (Some(condition), Some(evaluator)) = (&operation.condition, &self.inner.evaluator) {
            if !evaluator
                .eval_condition(condition, source)
                .map_err(as_config_error)?
            {
                return Ok(None);
            }
        }

        if let (Some(expression), Some(evaluator)) =
            (&operation.key_expression, &self.inner.evaluator)
        {
            return evaluator
                .render_key(expression, source)
                .map(|k| Some(crate::key::bound_key(&k)))
                .map_err(as_config_error);
        }

        if let Some(name) = &operation.key_generator {
            if let Some(generator) = self.inner.key_generators.get(name) {
                return Ok(Some(generator.generate(source)));
            }
            return Err(CacheError::ConfigurationInvalid {
                cache: operation.primary_cache().to_string(),
                reason: format!("unknown key generator '{name}'"),
            });
        }

        Ok(Some(DefaultKeyGenerator.generate(source)))
    }

    /// Whether a loaded result should be kept out of the cache per the
    /// operation's `unless` expression.
    #[must_use]
    pub fn store_vetoed(
        &self,
        operation: &CacheOperation,
        source: &KeySource,
        result: &Value,
    ) -> bool {
        match (&operation.unless, &self.inner.evaluator) {
            (Some(unless), Some(evaluator)) => evaluator
                .eval_unless(unless, source, result)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Background sweep: idle lock eviction + registry maintenance.
    fn start_maintenance(&self) {
        let inner = Arc::downgrade(&self.inner);
        let interval = Duration::from_millis(self.inner.config.cleanup.interval_ms.max(1_000));
        let lock_idle = self.inner.config.cleanup.lock_max_idle_time_ms;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                for entry in inner.handles.iter() {
                    entry.pool.evict_idle(lock_idle);
                    entry.registry.sweep().await;
                }
                debug!("maintenance sweep finished");
            }
        });
        *self.inner.sweeper.lock() = Some(handle);
    }

    /// Seed an operation builder with a cache's effective configuration.
    #[must_use]
    pub fn operation_for(&self, cache_name: &str) -> CacheOperationBuilder {
        let defaults = self.inner.config.cache_defaults(cache_name);
        CacheOperation::from_defaults(cache_name, &defaults)
    }

    /// Register a fully-resolved operation descriptor.
    ///
    /// Validation happens here — a registered operation never fails
    /// configuration checks at read time. Handles for all target caches
    /// are created eagerly.
    ///
    /// # Errors
    ///
    /// [`CacheError::ConfigurationInvalid`] from descriptor validation.
    pub fn register_operation(
        &self,
        operation: CacheOperation,
    ) -> Result<Arc<CacheOperation>, CacheError> {
        operation.validate()?;
        for cache in &operation.cache_names {
            let _ = self.handle(cache);
        }
        info!(
            caches = ?operation.cache_names,
            ttl = operation.ttl_seconds,
            "cache operation registered"
        );
        Ok(Arc::new(operation))
    }

    /// The handle for a cache, created lazily from the config table.
    pub fn handle(&self, cache_name: &str) -> Arc<CacheHandle> {
        if let Some(existing) = self.inner.handles.get(cache_name) {
            return existing.clone();
        }
        let built = self.build_handle(cache_name);
        self.inner
            .handles
            .entry(cache_name.to_string())
            .or_insert(built)
            .clone()
    }

    fn build_handle(&self, cache_name: &str) -> Arc<CacheHandle> {
        let inner = &self.inner;
        let defaults = inner.config.cache_defaults(cache_name);

        let policy = Arc::new(TtlPolicy::new(inner.clock.clone()));
        let pool = Arc::new(LockPool::new(
            inner.config.lock_pool.clone(),
            inner.clock.clone(),
        ));
        let registry = Arc::new(InvocationRegistry::new(
            &inner.config.registry,
            pool.clone(),
            inner.clock.clone(),
        ));
        let bloom = Arc::new(BloomFilter::new(
            inner.config.bloom.clone(),
            inner.redis.clone(),
        ));
        let store = Arc::new(EnvelopeStore::new(
            inner.redis.clone(),
            inner.codec.clone(),
            inner.clock.clone(),
        ));
        let guard = Arc::new(BreakdownGuard::new(
            pool.clone(),
            inner.dist.clone(),
            store.clone(),
            policy.clone(),
            bloom.clone(),
            inner.events.clone(),
            inner.clock.clone(),
            Duration::from_secs(inner.config.lock_pool.acquire_timeout_secs),
        ));

        let coordinator = Arc::new(RefreshCoordinator {
            registry: registry.clone(),
            guard: guard.clone(),
            executor: inner.refresh.clone(),
            events: inner.events.clone(),
            clock: inner.clock.clone(),
        });

        let mut strategies: Vec<Arc<dyn FetchStrategy>> = vec![
            Arc::new(SimpleStrategy),
            Arc::new(BloomStrategy::new(bloom.clone())),
            Arc::new(PreRefreshStrategy::new(policy.clone(), coordinator)),
        ];
        strategies.extend(inner.custom_strategies.iter().cloned());
        let strategies = Arc::new(StrategyChain::new(strategies));

        let handlers: Vec<Arc<dyn OpHandler>> = vec![
            Arc::new(BloomHandler::new(
                bloom.clone(),
                inner.events.clone(),
                inner.clock.clone(),
            )),
            Arc::new(SyncLockHandler::new(guard.clone())),
            Arc::new(TtlHandler::new(policy.clone())),
            Arc::new(NullValueHandler),
            Arc::new(DoubleDeleteHandler::new(
                store.clone(),
                defaults.double_delete_delay_ms,
            )),
            Arc::new(StorageHandler::new(
                store.clone(),
                policy.clone(),
                inner.events.clone(),
                inner.clock.clone(),
            )),
        ];
        let writer = CacheWriter::new(handlers);

        debug!(cache = %cache_name, "cache handle initialized");
        Arc::new(CacheHandle {
            name: cache_name.to_string(),
            writer,
            bloom,
            pool,
            registry,
            guard,
            strategies,
            events: inner.events.clone(),
            clock: inner.clock.clone(),
            counters: inner.counters.clone(),
        })
    }

    /// Read from the operation's caches, first hit wins.
    ///
    /// # Errors
    ///
    /// Storage failures that cannot degrade to a miss.
    pub async fn get(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
    ) -> Result<Option<Value>, CacheError> {
        for cache in &operation.cache_names {
            if let Some(value) = self.handle(cache).get(operation, rendered_key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Read-through across the operation's caches.
    ///
    /// The primary cache runs the full protected pipeline; secondary caches
    /// are probed first and back-filled after a successful load.
    ///
    /// # Errors
    ///
    /// Loader and storage failures propagate.
    pub async fn get_or_load(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
        loader: Arc<dyn Loader>,
    ) -> Result<Option<Value>, CacheError> {
        let primary = operation.primary_cache().to_string();

        // Probe the non-primary caches without triggering loads.
        for cache in operation.cache_names.iter().skip(1) {
            if let Some(value) = self.handle(cache).get(operation, rendered_key).await? {
                return Ok(Some(value));
            }
        }

        let result = self
            .handle(&primary)
            .get_or_load(operation, rendered_key, loader)
            .await?;

        // Back-fill the other caches with whatever the primary settled on.
        if operation.cache_names.len() > 1 {
            for cache in operation.cache_names.iter().skip(1) {
                let write = match &result {
                    Some(value) => Some(Some(value.clone())),
                    None if operation.cache_null_values => Some(None),
                    None => None,
                };
                if let Some(payload) = write {
                    if let Err(e) = self.handle(cache).put(operation, rendered_key, payload).await {
                        warn!(cache = %cache, error = %e, "secondary cache back-fill failed");
                    }
                }
            }
        }
        Ok(result)
    }

    /// Write to every cache the operation declares.
    ///
    /// # Errors
    ///
    /// The first write failure propagates.
    pub async fn put(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
        value: Option<Value>,
    ) -> Result<(), CacheError> {
        for cache in &operation.cache_names {
            self.handle(cache)
                .put(operation, rendered_key, value.clone())
                .await?;
        }
        Ok(())
    }

    /// Write-if-absent on the primary cache, back-filling the rest when the
    /// write wins.
    ///
    /// # Errors
    ///
    /// Write failures propagate.
    pub async fn put_if_absent(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: &str,
        value: Option<Value>,
    ) -> Result<bool, CacheError> {
        let primary = operation.primary_cache().to_string();
        let stored = self
            .handle(&primary)
            .put_if_absent(operation, rendered_key, value.clone())
            .await?;
        if stored {
            for cache in operation.cache_names.iter().skip(1) {
                self.handle(cache)
                    .put(operation, rendered_key, value.clone())
                    .await?;
            }
        }
        Ok(stored)
    }

    /// Evict one key, or every entry when `rendered_key` is `None`.
    ///
    /// # Errors
    ///
    /// Storage failures propagate.
    pub async fn evict(
        &self,
        operation: &Arc<CacheOperation>,
        rendered_key: Option<&str>,
    ) -> Result<u64, CacheError> {
        let key = crate::registry::normalize_evict_key(rendered_key);
        let mut total = 0;
        for cache in &operation.cache_names {
            let handle = self.handle(cache);
            total += if key == crate::registry::WILDCARD_KEY {
                handle.clean(operation).await?
            } else {
                handle.evict(operation, key).await?
            };
        }
        Ok(total)
    }

    /// Cancel a pending pre-refresh for a key.
    pub fn cancel_refresh(&self, cache: &str, rendered_key: &str) -> bool {
        let key = CacheKey::new(cache, rendered_key);
        self.inner.refresh.cancel(&key.storage_key())
    }

    /// Redis connectivity check.
    pub async fn health_check(&self) -> bool {
        match self.inner.redis.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "redis health check failed");
                false
            }
        }
    }

    /// Drain the refresh executor and stop maintenance.
    pub async fn shutdown(&self) {
        self.inner.refresh.shutdown().await;
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
        info!("cache manager shut down");
    }

    #[must_use]
    pub fn stats(&self) -> ShieldStats {
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        ShieldStats {
            hits,
            misses,
            puts: counters.puts.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            hit_rate,
            refresh: self.inner.refresh.stats(),
            caches: self
                .inner
                .handles
                .iter()
                .map(|entry| entry.stats())
                .collect(),
        }
    }
}
