//! Cache operation descriptors
//!
//! A [`CacheOperation`] is the immutable, fully-resolved description of one
//! cached method: which caches it targets, how its key is rendered, and
//! which protections (bloom, locks, null caching, pre-refresh) apply. The
//! binding layer builds one per annotated method and registers it with the
//! manager; validation happens here, at registration, never at read time.

use serde::{Deserialize, Serialize};

use crate::config::CacheDefaults;
use crate::error::CacheError;

/// What a triggered pre-refresh does with the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreRefreshMode {
    /// Force a miss so the caller reloads synchronously.
    Sync,
    /// Return the current value and refresh in the background.
    Async,
}

/// Which fetch strategy the read path selects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategyKind {
    /// Pick from the enabled features (bloom / pre-refresh / simple).
    Auto,
    /// Return the raw value unchanged.
    Simple,
    /// A strategy registered by name.
    Custom(String),
}

/// Immutable descriptor for one cached method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheOperation {
    /// Target caches, in declaration order. Never empty.
    pub cache_names: Vec<String>,
    /// Key expression for the injected evaluator, if any.
    pub key_expression: Option<String>,
    /// Named key generator, if any. Absent both ⇒ default generator.
    pub key_generator: Option<String>,
    /// Cache only when this evaluates true.
    pub condition: Option<String>,
    /// Veto caching of a loaded result when this evaluates true.
    pub unless: Option<String>,
    /// TTL in seconds; 0 means never expire.
    pub ttl_seconds: u64,
    /// Apply Gaussian jitter to the TTL.
    pub random_ttl: bool,
    /// Jitter width as a fraction of the base TTL, in `[0, 1]`.
    pub variance: f64,
    /// Consult the two-tier bloom filter before reads.
    pub use_bloom_filter: bool,
    /// Cache loader nulls as the null marker.
    pub cache_null_values: bool,
    /// Coalesce concurrent misses behind the breakdown guard.
    pub sync: bool,
    /// Take the cluster-wide lock around origin loads.
    pub distributed_lock: bool,
    /// Logical name for the distributed lock. Required when enabled.
    pub distributed_lock_name: Option<String>,
    /// Take the process-local keyed lock around origin loads.
    pub internal_lock: bool,
    /// Refresh proactively near end-of-life.
    pub enable_pre_refresh: bool,
    /// Fraction of life remaining at which refresh triggers, in `(0, 1)`.
    pub pre_refresh_threshold: f64,
    pub pre_refresh_mode: PreRefreshMode,
    pub fetch_strategy: FetchStrategyKind,
    /// Declared return type name, recorded in envelopes.
    pub return_type: String,
}

impl CacheOperation {
    /// Start a builder seeded from global defaults.
    #[must_use]
    pub fn builder(cache_name: impl Into<String>) -> CacheOperationBuilder {
        CacheOperationBuilder::new(cache_name)
    }

    /// Seed a builder from a merged per-cache configuration.
    #[must_use]
    pub fn from_defaults(cache_name: impl Into<String>, defaults: &CacheDefaults) -> CacheOperationBuilder {
        CacheOperationBuilder::new(cache_name).apply_defaults(defaults)
    }

    /// Whether any locking tier applies to reads of this operation.
    #[must_use]
    pub fn needs_load_guard(&self) -> bool {
        self.sync || self.distributed_lock || self.internal_lock
    }

    /// Primary cache name (the first declared).
    #[must_use]
    pub fn primary_cache(&self) -> &str {
        self.cache_names.first().map_or("", String::as_str)
    }

    /// Stable signature of the features that decide strategy-chain
    /// composition. Equal signatures share one composed chain.
    #[must_use]
    pub fn strategy_signature(&self) -> String {
        let strategy = match &self.fetch_strategy {
            FetchStrategyKind::Auto => "auto".to_string(),
            FetchStrategyKind::Simple => "simple".to_string(),
            FetchStrategyKind::Custom(name) => format!("custom:{name}"),
        };
        format!(
            "bloom={}|refresh={}|mode={:?}|strategy={strategy}",
            u8::from(self.use_bloom_filter),
            u8::from(self.enable_pre_refresh),
            self.pre_refresh_mode,
        )
    }

    /// Validate the descriptor. Called at registration; invalid descriptors
    /// never reach the read path.
    ///
    /// # Errors
    ///
    /// [`CacheError::ConfigurationInvalid`] naming the violated constraint.
    pub fn validate(&self) -> Result<(), CacheError> {
        let fail = |reason: &str| {
            Err(CacheError::ConfigurationInvalid {
                cache: self.primary_cache().to_string(),
                reason: reason.to_string(),
            })
        };

        if self.cache_names.is_empty() || self.cache_names.iter().any(|n| n.trim().is_empty()) {
            return fail("cache names must be a non-empty sequence of non-blank names");
        }
        if !(0.0..=1.0).contains(&self.variance) {
            return fail("variance must lie in [0, 1]");
        }
        if self.random_ttl && self.variance <= 0.0 {
            return fail("random ttl requires variance > 0");
        }
        if self.distributed_lock
            && self
                .distributed_lock_name
                .as_deref()
                .is_none_or(|n| n.trim().is_empty())
        {
            return fail("distributed lock requires a non-blank lock name");
        }
        if self.enable_pre_refresh {
            if self.ttl_seconds == 0 {
                return fail("pre-refresh requires ttl > 0");
            }
            if !(0.0..1.0).contains(&self.pre_refresh_threshold)
                || self.pre_refresh_threshold <= 0.0
            {
                return fail("pre-refresh threshold must lie in (0, 1)");
            }
        }
        Ok(())
    }
}

/// Builder for [`CacheOperation`]
///
/// `build` runs validation, so an obtained descriptor is always usable.
#[derive(Debug, Clone)]
pub struct CacheOperationBuilder {
    op: CacheOperation,
}

impl CacheOperationBuilder {
    fn new(cache_name: impl Into<String>) -> Self {
        Self {
            op: CacheOperation {
                cache_names: vec![cache_name.into()],
                key_expression: None,
                key_generator: None,
                condition: None,
                unless: None,
                ttl_seconds: 0,
                random_ttl: false,
                variance: 0.0,
                use_bloom_filter: false,
                cache_null_values: false,
                sync: false,
                distributed_lock: false,
                distributed_lock_name: None,
                internal_lock: false,
                enable_pre_refresh: false,
                pre_refresh_threshold: 0.3,
                pre_refresh_mode: PreRefreshMode::Async,
                fetch_strategy: FetchStrategyKind::Auto,
                return_type: "serde_json::Value".to_string(),
            },
        }
    }

    fn apply_defaults(mut self, defaults: &CacheDefaults) -> Self {
        self.op.ttl_seconds = defaults.ttl_seconds;
        self.op.random_ttl = defaults.random_ttl;
        self.op.variance = defaults.variance;
        self.op.use_bloom_filter = defaults.use_bloom_filter;
        self.op.cache_null_values = defaults.cache_null_values;
        self.op.sync = defaults.sync;
        self.op.distributed_lock = defaults.distributed_lock;
        self.op.distributed_lock_name = defaults.distributed_lock_name.clone();
        self.op.internal_lock = defaults.internal_lock;
        self.op.enable_pre_refresh = defaults.enable_pre_refresh;
        self.op.pre_refresh_threshold = defaults.pre_refresh_threshold;
        self.op.pre_refresh_mode = defaults.pre_refresh_mode;
        self.op.fetch_strategy = defaults.fetch_strategy.clone();
        self
    }

    #[must_use]
    pub fn also_caches(mut self, cache_name: impl Into<String>) -> Self {
        self.op.cache_names.push(cache_name.into());
        self
    }

    #[must_use]
    pub fn key_expression(mut self, expr: impl Into<String>) -> Self {
        self.op.key_expression = Some(expr.into());
        self
    }

    #[must_use]
    pub fn key_generator(mut self, name: impl Into<String>) -> Self {
        self.op.key_generator = Some(name.into());
        self
    }

    #[must_use]
    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.op.condition = Some(expr.into());
        self
    }

    #[must_use]
    pub fn unless(mut self, expr: impl Into<String>) -> Self {
        self.op.unless = Some(expr.into());
        self
    }

    #[must_use]
    pub fn ttl_seconds(mut self, ttl: u64) -> Self {
        self.op.ttl_seconds = ttl;
        self
    }

    #[must_use]
    pub fn random_ttl(mut self, variance: f64) -> Self {
        self.op.random_ttl = true;
        self.op.variance = variance;
        self
    }

    #[must_use]
    pub fn use_bloom_filter(mut self, enabled: bool) -> Self {
        self.op.use_bloom_filter = enabled;
        self
    }

    #[must_use]
    pub fn cache_null_values(mut self, enabled: bool) -> Self {
        self.op.cache_null_values = enabled;
        self
    }

    #[must_use]
    pub fn sync(mut self, enabled: bool) -> Self {
        self.op.sync = enabled;
        self
    }

    #[must_use]
    pub fn distributed_lock(mut self, name: impl Into<String>) -> Self {
        self.op.distributed_lock = true;
        self.op.distributed_lock_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn internal_lock(mut self, enabled: bool) -> Self {
        self.op.internal_lock = enabled;
        self
    }

    #[must_use]
    pub fn pre_refresh(mut self, threshold: f64, mode: PreRefreshMode) -> Self {
        self.op.enable_pre_refresh = true;
        self.op.pre_refresh_threshold = threshold;
        self.op.pre_refresh_mode = mode;
        self
    }

    #[must_use]
    pub fn fetch_strategy(mut self, kind: FetchStrategyKind) -> Self {
        self.op.fetch_strategy = kind;
        self
    }

    #[must_use]
    pub fn return_type(mut self, name: impl Into<String>) -> Self {
        self.op.return_type = name.into();
        self
    }

    /// Validate and produce the descriptor.
    ///
    /// # Errors
    ///
    /// [`CacheError::ConfigurationInvalid`] when any invariant fails.
    pub fn build(self) -> Result<CacheOperation, CacheError> {
        self.op.validate()?;
        Ok(self.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_operation_builds() {
        let op = CacheOperation::builder("users")
            .ttl_seconds(300)
            .build()
            .unwrap();
        assert_eq!(op.primary_cache(), "users");
        assert!(!op.needs_load_guard());
    }

    #[test]
    fn pre_refresh_requires_positive_ttl() {
        let err = CacheOperation::builder("users")
            .pre_refresh(0.3, PreRefreshMode::Async)
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn random_ttl_requires_variance() {
        let err = CacheOperation::builder("users")
            .ttl_seconds(60)
            .random_ttl(0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn variance_outside_unit_interval_is_rejected() {
        let err = CacheOperation::builder("users")
            .ttl_seconds(60)
            .random_ttl(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn distributed_lock_requires_name() {
        let mut op = CacheOperation::builder("users")
            .ttl_seconds(60)
            .build()
            .unwrap();
        op.distributed_lock = true;
        op.distributed_lock_name = Some("  ".into());
        assert!(op.validate().is_err());
    }

    #[test]
    fn threshold_bounds_are_enforced() {
        for bad in [0.0, 1.0, -0.1, 1.1] {
            let err = CacheOperation::builder("users")
                .ttl_seconds(60)
                .pre_refresh(bad, PreRefreshMode::Sync)
                .build()
                .unwrap_err();
            assert!(matches!(err, CacheError::ConfigurationInvalid { .. }), "threshold {bad}");
        }
    }

    #[test]
    fn signature_distinguishes_feature_sets() {
        let plain = CacheOperation::builder("users").ttl_seconds(60).build().unwrap();
        let bloomed = CacheOperation::builder("users")
            .ttl_seconds(60)
            .use_bloom_filter(true)
            .build()
            .unwrap();
        assert_ne!(plain.strategy_signature(), bloomed.strategy_signature());
        assert_eq!(plain.strategy_signature(), plain.strategy_signature());
    }

    #[test]
    fn lock_flags_imply_guard() {
        let op = CacheOperation::builder("users")
            .ttl_seconds(60)
            .internal_lock(true)
            .build()
            .unwrap();
        assert!(op.needs_load_guard());
    }
}
