//! Cache Shield
//!
//! A Redis-backed cache engine hardened against the three classical cache
//! failure modes:
//! - **Penetration**: a two-tier bloom filter (local bitset + shared Redis
//!   hash) rejects lookups of keys that were never written
//! - **Breakdown**: triple-checked loading behind a keyed local lock pool
//!   and a distributed lease lock coalesces a thundering herd into one
//!   origin call
//! - **Avalanche**: Gaussian TTL jitter breaks up correlated expiry, and a
//!   pre-refresh executor renews hot keys before they die
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cache_shield::{CacheShield, loader_fn};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let shield = CacheShield::builder()
//!         .redis_url("redis://127.0.0.1:6379")
//!         .build()
//!         .await?;
//!
//!     let op = shield.manager().register_operation(
//!         shield
//!             .manager()
//!             .operation_for("users")
//!             .ttl_seconds(300)
//!             .random_ttl(0.5)
//!             .use_bloom_filter(true)
//!             .build()?,
//!     )?;
//!
//!     let loader = Arc::new(loader_fn(|| async {
//!         anyhow::Ok(Some(serde_json::json!({"id": 1, "name": "David"})))
//!     }));
//!     let user = shield.manager().get_or_load(&op, "1", loader).await?;
//!     println!("user: {user:?}");
//!
//!     shield.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Manager → Writer chain (bloom → sync-lock → ttl → null → double-delete
//!           → redis) → envelope decode → fetch strategies (bloom /
//!           pre-refresh / simple) → optional refresh submit → value
//! ```

pub mod bloom;
pub mod clock;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod guard;
pub mod key;
pub mod lock;
pub mod manager;
pub mod operation;
pub mod redis_client;
pub mod refresh;
pub mod registry;
pub mod store;
pub mod strategy;
pub mod traits;
pub mod ttl;
pub mod writer;

use std::sync::Arc;

use crate::clock::SystemClock;
use crate::codec::JsonCodec;
use crate::config::ShieldConfig;
use crate::error::CacheError;
use crate::events::TracingEventPublisher;
use crate::lock::RedisLeaseLock;
use crate::manager::CacheManager;
use crate::redis_client::ConnectionManagerClient;
use crate::strategy::FetchStrategy;
use crate::traits::{Clock, Codec, DistributedLock, ExpressionEvaluator, KeyGenerator, RedisClient};

pub use crate::clock::ManualClock;
pub use crate::config::{CacheDefaults, CacheOverrides};
pub use crate::envelope::ValueEnvelope;
pub use crate::events::{CacheEvent, CacheEventKind, ChannelEventPublisher, EventPublisher};
pub use crate::key::{CacheKey, DefaultKeyGenerator, KeySource};
pub use crate::manager::ShieldStats;
pub use crate::operation::{CacheOperation, FetchStrategyKind, PreRefreshMode};
pub use crate::traits::{Loader, loader_fn};

// Re-export async_trait for custom backends and strategies.
pub use async_trait::async_trait;

/// Main entry point
///
/// Wraps the [`CacheManager`] plus the wiring the builder assembled.
#[derive(Clone)]
pub struct CacheShield {
    manager: CacheManager,
}

impl CacheShield {
    /// Start configuring an engine.
    #[must_use]
    pub fn builder() -> CacheShieldBuilder {
        CacheShieldBuilder::new()
    }

    /// The manager (primary interface for all cache operations).
    #[must_use]
    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    /// Redis connectivity check.
    pub async fn health_check(&self) -> bool {
        self.manager.health_check().await
    }

    /// Drain background work and stop maintenance tasks.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Engine-wide statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ShieldStats {
        self.manager.stats()
    }
}

/// Builder wiring custom collaborators into the engine
///
/// Everything is optional: the default build connects to `REDIS_URL`
/// (falling back to `redis://127.0.0.1:6379`), uses the system clock, the
/// JSON codec, tracing-backed events, and a Redis lease lock sharing the
/// same client.
pub struct CacheShieldBuilder {
    config: ShieldConfig,
    redis_url: Option<String>,
    redis: Option<Arc<dyn RedisClient>>,
    codec: Option<Arc<dyn Codec>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventPublisher>>,
    dist: Option<Arc<dyn DistributedLock>>,
    strategies: Vec<Arc<dyn FetchStrategy>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    key_generators: std::collections::HashMap<String, Arc<dyn KeyGenerator>>,
}

impl CacheShieldBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ShieldConfig::default(),
            redis_url: None,
            redis: None,
            codec: None,
            clock: None,
            events: None,
            dist: None,
            strategies: Vec::new(),
            evaluator: None,
            key_generators: std::collections::HashMap::new(),
        }
    }

    /// Use a full configuration table (global defaults + per-cache
    /// overrides).
    #[must_use]
    pub fn config(mut self, config: ShieldConfig) -> Self {
        self.config = config;
        self
    }

    /// Connect to a specific Redis URL instead of `REDIS_URL`.
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Inject a custom Redis client (e.g. a test double).
    #[must_use]
    pub fn redis_client(mut self, client: Arc<dyn RedisClient>) -> Self {
        self.redis = Some(client);
        self
    }

    /// Inject a custom envelope codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Inject a clock (tests drive a [`ManualClock`]).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Inject an event publisher.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Inject a distributed lock implementation.
    #[must_use]
    pub fn distributed_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.dist = Some(lock);
        self
    }

    /// Register a custom fetch strategy, selectable by name through
    /// [`FetchStrategyKind::Custom`].
    #[must_use]
    pub fn fetch_strategy(mut self, strategy: Arc<dyn FetchStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Inject an expression engine for key / condition / unless
    /// expressions.
    #[must_use]
    pub fn expression_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Register a named key generator, selectable per operation.
    #[must_use]
    pub fn key_generator(
        mut self,
        name: impl Into<String>,
        generator: Arc<dyn KeyGenerator>,
    ) -> Self {
        self.key_generators.insert(name.into(), generator);
        self
    }

    /// Assemble the engine.
    ///
    /// # Errors
    ///
    /// Fails when no Redis client was injected and the connection to the
    /// configured URL cannot be established.
    pub async fn build(self) -> Result<CacheShield, CacheError> {
        let redis: Arc<dyn RedisClient> = match self.redis {
            Some(client) => client,
            None => match &self.redis_url {
                Some(url) => Arc::new(ConnectionManagerClient::with_url(url).await?),
                None => Arc::new(ConnectionManagerClient::new().await?),
            },
        };
        let codec: Arc<dyn Codec> = self.codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events: Arc<dyn EventPublisher> = self
            .events
            .unwrap_or_else(|| Arc::new(TracingEventPublisher));
        let dist: Arc<dyn DistributedLock> = self
            .dist
            .unwrap_or_else(|| Arc::new(RedisLeaseLock::new(redis.clone())));

        let manager = CacheManager::new(
            self.config,
            redis,
            codec,
            clock,
            events,
            dist,
            self.strategies,
            self.evaluator,
            self.key_generators,
        );
        Ok(CacheShield { manager })
    }
}

impl Default for CacheShieldBuilder {
    fn default() -> Self {
        Self::new()
    }
}
