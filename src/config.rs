//! Engine configuration
//!
//! Global defaults plus per-cache overrides. A cache's effective settings
//! are the global [`CacheDefaults`] with that cache's [`CacheOverrides`]
//! shadowed on top; operations built through the manager inherit the merged
//! result unless the descriptor itself says otherwise.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::operation::{FetchStrategyKind, PreRefreshMode};

/// Default bloom bit-vector size: 2²³ bits (1 MiB of state per cache).
pub const DEFAULT_BLOOM_BIT_SIZE: u64 = 8_388_608;

/// Default number of bloom hash functions.
pub const DEFAULT_BLOOM_HASHES: u32 = 3;

/// Default Redis key prefix for bloom filter hashes.
pub const DEFAULT_BLOOM_PREFIX: &str = "bf:cache:";

/// Per-cache behavioural defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDefaults {
    /// TTL in seconds; 0 means never expire.
    pub ttl_seconds: u64,
    pub random_ttl: bool,
    /// Jitter width fraction in `[0, 1]`.
    pub variance: f64,
    pub use_bloom_filter: bool,
    pub cache_null_values: bool,
    pub sync: bool,
    pub distributed_lock: bool,
    pub distributed_lock_name: Option<String>,
    pub internal_lock: bool,
    pub enable_pre_refresh: bool,
    pub pre_refresh_threshold: f64,
    pub pre_refresh_mode: PreRefreshMode,
    pub fetch_strategy: FetchStrategyKind,
    /// Second delete delay for EVICT/CLEAN; `None` disables the second pass.
    pub double_delete_delay_ms: Option<u64>,
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
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
            double_delete_delay_ms: Some(300),
        }
    }
}

/// Optional per-cache overrides shadowing [`CacheDefaults`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheOverrides {
    pub ttl_seconds: Option<u64>,
    pub random_ttl: Option<bool>,
    pub variance: Option<f64>,
    pub use_bloom_filter: Option<bool>,
    pub cache_null_values: Option<bool>,
    pub sync: Option<bool>,
    pub distributed_lock: Option<bool>,
    pub distributed_lock_name: Option<String>,
    pub internal_lock: Option<bool>,
    pub enable_pre_refresh: Option<bool>,
    pub pre_refresh_threshold: Option<f64>,
    pub pre_refresh_mode: Option<PreRefreshMode>,
    pub fetch_strategy: Option<FetchStrategyKind>,
    pub double_delete_delay_ms: Option<Option<u64>>,
}

impl CacheOverrides {
    /// Apply these overrides on top of the global defaults.
    #[must_use]
    pub fn merged_over(&self, defaults: &CacheDefaults) -> CacheDefaults {
        CacheDefaults {
            ttl_seconds: self.ttl_seconds.unwrap_or(defaults.ttl_seconds),
            random_ttl: self.random_ttl.unwrap_or(defaults.random_ttl),
            variance: self.variance.unwrap_or(defaults.variance),
            use_bloom_filter: self.use_bloom_filter.unwrap_or(defaults.use_bloom_filter),
            cache_null_values: self
                .cache_null_values
                .unwrap_or(defaults.cache_null_values),
            sync: self.sync.unwrap_or(defaults.sync),
            distributed_lock: self.distributed_lock.unwrap_or(defaults.distributed_lock),
            distributed_lock_name: self
                .distributed_lock_name
                .clone()
                .or_else(|| defaults.distributed_lock_name.clone()),
            internal_lock: self.internal_lock.unwrap_or(defaults.internal_lock),
            enable_pre_refresh: self
                .enable_pre_refresh
                .unwrap_or(defaults.enable_pre_refresh),
            pre_refresh_threshold: self
                .pre_refresh_threshold
                .unwrap_or(defaults.pre_refresh_threshold),
            pre_refresh_mode: self.pre_refresh_mode.unwrap_or(defaults.pre_refresh_mode),
            fetch_strategy: self
                .fetch_strategy
                .clone()
                .unwrap_or_else(|| defaults.fetch_strategy.clone()),
            double_delete_delay_ms: self
                .double_delete_delay_ms
                .unwrap_or(defaults.double_delete_delay_ms),
        }
    }
}

/// Bloom filter sizing, shared by all caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    /// Bit-vector size. Must be ≥ 1.
    pub bit_size: u64,
    /// Number of hash functions. Must be ≥ 1.
    pub hash_functions: u32,
    /// Redis key prefix for the remote tier.
    pub key_prefix: String,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            bit_size: DEFAULT_BLOOM_BIT_SIZE,
            hash_functions: DEFAULT_BLOOM_HASHES,
            key_prefix: DEFAULT_BLOOM_PREFIX.to_string(),
        }
    }
}

/// Keyed lock pool bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockPoolConfig {
    /// Soft bound on the active list.
    pub max_active: usize,
    /// Soft bound on the inactive list.
    pub max_inactive: usize,
    /// Local lock acquisition timeout in seconds.
    pub acquire_timeout_secs: u64,
}

impl Default for LockPoolConfig {
    fn default() -> Self {
        Self {
            max_active: 1_024,
            max_inactive: 512,
            acquire_timeout_secs: 10,
        }
    }
}

/// Invocation registry sizing and idle eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub initial_capacity: u64,
    /// Sizing hint: effective capacity is `initial_capacity / load_factor`.
    pub load_factor: f64,
    /// Sizing hint carried for configuration parity; sharding is internal.
    pub concurrency_level: usize,
    /// Idle time after which an invocation entry is eligible for cleanup.
    pub invocation_max_idle_time_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1_024,
            load_factor: 0.75,
            concurrency_level: 16,
            invocation_max_idle_time_ms: 1_800_000,
        }
    }
}

impl RegistryConfig {
    /// Capacity after accounting for the load factor.
    #[must_use]
    pub fn effective_capacity(&self) -> u64 {
        if self.load_factor > 0.0 {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                (self.initial_capacity as f64 / self.load_factor).ceil() as u64
            }
        } else {
            self.initial_capacity
        }
    }
}

/// Periodic maintenance sweeps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in milliseconds.
    pub interval_ms: u64,
    /// Idle time after which an unused lock is eligible for eviction.
    pub lock_max_idle_time_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_600_000,
            lock_max_idle_time_ms: 1_800_000,
        }
    }
}

/// Pre-refresh executor sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Maximum concurrent refreshes; 0 means `available cores × 2`.
    pub max_workers: usize,
    /// Shutdown drain grace in seconds before forced cancellation.
    pub shutdown_grace_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            shutdown_grace_secs: 30,
        }
    }
}

impl RefreshConfig {
    /// Resolve the worker bound, defaulting to CPU × 2.
    #[must_use]
    pub fn worker_bound(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
                * 2
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShieldConfig {
    pub defaults: CacheDefaults,
    /// Per-cache overrides, keyed by cache name.
    pub caches: HashMap<String, CacheOverrides>,
    pub bloom: BloomConfig,
    pub lock_pool: LockPoolConfig,
    pub registry: RegistryConfig,
    pub cleanup: CleanupConfig,
    pub refresh: RefreshConfig,
}

impl ShieldConfig {
    /// Effective settings for a cache: overrides shadow the global defaults.
    #[must_use]
    pub fn cache_defaults(&self, cache_name: &str) -> CacheDefaults {
        self.caches
            .get(cache_name)
            .map_or_else(|| self.defaults.clone(), |o| o.merged_over(&self.defaults))
    }
}
