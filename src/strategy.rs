//! Fetch strategy chain
//!
//! At read time a small chain of strategies post-processes the raw cache
//! result: the bloom strategy marks definite misses as possible
//! penetration so the caller skips the origin, the pre-refresh strategy
//! schedules (or forces) a reload near end-of-life, and the simple
//! strategy is the terminal no-op. Strategies are ordered by ascending
//! priority; composition is a pure function of the operation's feature
//! signature and is cached per signature.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::bloom::BloomFilter;
use crate::envelope::ValueEnvelope;
use crate::key::CacheKey;
use crate::operation::{CacheOperation, FetchStrategyKind, PreRefreshMode};
use crate::ttl::TtlPolicy;

/// Mutable read context flowing through the strategies
pub struct FetchContext {
    pub operation: Arc<CacheOperation>,
    pub key: CacheKey,
    /// What the cache read produced, if anything.
    pub envelope: Option<ValueEnvelope>,
    /// Set by the bloom strategy: the key was never written, skip the
    /// origin.
    pub possible_penetration: bool,
    /// Set by the pre-refresh strategy in SYNC mode: discard the value and
    /// reload.
    pub force_miss: bool,
    /// Set when an asynchronous refresh was submitted for this read.
    pub refresh_submitted: bool,
}

impl FetchContext {
    #[must_use]
    pub fn new(operation: Arc<CacheOperation>, key: CacheKey, envelope: Option<ValueEnvelope>) -> Self {
        Self {
            operation,
            key,
            envelope,
            possible_penetration: false,
            force_miss: false,
            refresh_submitted: false,
        }
    }
}

/// Sink through which the pre-refresh strategy schedules work
///
/// Implemented by the cache handle, which knows how to resolve the
/// invocation and run the guarded refresh.
pub trait RefreshSubmitter: Send + Sync {
    /// Schedule a refresh; returns whether it was accepted (not
    /// deduplicated).
    fn submit_refresh(&self, key: &CacheKey, operation: &Arc<CacheOperation>, observed_version: u64)
    -> bool;
}

/// One pluggable read post-processor
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Registration name; custom strategies are selected by this.
    fn name(&self) -> &'static str;

    /// Ascending order of application. The simple strategy is `i32::MAX`.
    fn priority(&self) -> i32;

    /// Whether this strategy participates for the given operation.
    fn supports(&self, operation: &CacheOperation) -> bool;

    async fn apply(&self, ctx: &mut FetchContext);
}

/// Terminal fallback: the value passes through unchanged
pub struct SimpleStrategy;

#[async_trait]
impl FetchStrategy for SimpleStrategy {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn supports(&self, _operation: &CacheOperation) -> bool {
        true
    }

    async fn apply(&self, _ctx: &mut FetchContext) {}
}

/// Penetration pre-filter
pub struct BloomStrategy {
    bloom: Arc<BloomFilter>,
}

impl BloomStrategy {
    #[must_use]
    pub fn new(bloom: Arc<BloomFilter>) -> Self {
        Self { bloom }
    }
}

#[async_trait]
impl FetchStrategy for BloomStrategy {
    fn name(&self) -> &'static str {
        "bloom"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn supports(&self, operation: &CacheOperation) -> bool {
        operation.use_bloom_filter
    }

    async fn apply(&self, ctx: &mut FetchContext) {
        if ctx.envelope.is_some() {
            return; // a present value obviously passed the filter
        }
        if !self
            .bloom
            .might_contain(ctx.key.cache_name(), ctx.key.rendered())
            .await
        {
            ctx.possible_penetration = true;
            debug!(key = %ctx.key, "bloom rejected; origin load will be skipped");
        }
    }
}

/// End-of-life refresh trigger
pub struct PreRefreshStrategy {
    policy: Arc<TtlPolicy>,
    submitter: Arc<dyn RefreshSubmitter>,
}

impl PreRefreshStrategy {
    #[must_use]
    pub fn new(policy: Arc<TtlPolicy>, submitter: Arc<dyn RefreshSubmitter>) -> Self {
        Self { policy, submitter }
    }
}

#[async_trait]
impl FetchStrategy for PreRefreshStrategy {
    fn name(&self) -> &'static str {
        "pre-refresh"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn supports(&self, operation: &CacheOperation) -> bool {
        operation.enable_pre_refresh
    }

    async fn apply(&self, ctx: &mut FetchContext) {
        let Some(envelope) = &ctx.envelope else {
            return;
        };
        let due = self.policy.should_pre_refresh(
            envelope.created_time,
            envelope.storage_ttl_seconds().unwrap_or(0),
            ctx.operation.pre_refresh_threshold,
        );
        if !due {
            return;
        }
        match ctx.operation.pre_refresh_mode {
            PreRefreshMode::Async => {
                ctx.refresh_submitted =
                    self.submitter
                        .submit_refresh(&ctx.key, &ctx.operation, envelope.version);
            }
            PreRefreshMode::Sync => {
                ctx.force_miss = true;
            }
        }
    }
}

/// Ordered, signature-cached strategy composition
pub struct StrategyChain {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    composed: DashMap<String, Arc<Vec<Arc<dyn FetchStrategy>>>>,
}

impl StrategyChain {
    /// Build a chain from the built-in strategies plus any custom ones.
    #[must_use]
    pub fn new(mut strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        strategies.sort_by_key(|s| s.priority());
        Self {
            strategies,
            composed: DashMap::new(),
        }
    }

    /// The strategies applicable to an operation, priority-ascending.
    ///
    /// Composition depends only on the operation's feature signature, so it
    /// is computed once per signature.
    #[must_use]
    pub fn select(&self, operation: &CacheOperation) -> Arc<Vec<Arc<dyn FetchStrategy>>> {
        let signature = operation.strategy_signature();
        if let Some(cached) = self.composed.get(&signature) {
            return cached.clone();
        }
        let composed = Arc::new(self.compose(operation));
        self.composed.insert(signature, composed.clone());
        composed
    }

    fn compose(&self, operation: &CacheOperation) -> Vec<Arc<dyn FetchStrategy>> {
        match &operation.fetch_strategy {
            FetchStrategyKind::Simple => self
                .strategies
                .iter()
                .filter(|s| s.name() == "simple")
                .cloned()
                .collect(),
            FetchStrategyKind::Custom(name) => {
                let mut chain: Vec<Arc<dyn FetchStrategy>> = self
                    .strategies
                    .iter()
                    .filter(|s| s.name() == name.as_str())
                    .cloned()
                    .collect();
                // Simple stays as the terminal fallback.
                chain.extend(
                    self.strategies
                        .iter()
                        .filter(|s| s.name() == "simple")
                        .cloned(),
                );
                chain
            }
            FetchStrategyKind::Auto => self
                .strategies
                .iter()
                .filter(|s| s.supports(operation))
                .cloned()
                .collect(),
        }
    }

    /// Run the selected strategies over a read result.
    pub async fn apply(&self, ctx: &mut FetchContext) {
        let operation = ctx.operation.clone();
        for strategy in self.select(&operation).iter() {
            strategy.apply(ctx).await;
        }
    }
}
