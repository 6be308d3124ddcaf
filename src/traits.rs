//! Consumed contracts
//!
//! This module defines the seams between the cache engine and its
//! collaborators. Everything the engine needs from the outside world —
//! time, Redis transport, origin loading, value serialization, key
//! expression evaluation, distributed locking — flows through one of these
//! traits, which is what lets the integration tests run against in-memory
//! fakes and a hand-driven clock.
//!
//! # Architecture
//!
//! - [`Clock`]: single time source for every expiry/refresh decision
//! - [`RedisClient`]: the narrow Redis surface the engine consumes
//! - [`Loader`]: origin fetch invoked under the breakdown guard
//! - [`Codec`]: envelope bytes on the wire
//! - [`DistributedLock`]: cluster-wide mutual exclusion with a lease
//! - [`ExpressionEvaluator`] / [`KeyGenerator`]: key rendering seam

use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::ValueEnvelope;
use crate::error::CacheError;
use crate::key::KeySource;

/// Time source. All engine time decisions route through this.
pub trait Clock: Send + Sync {
    /// Current instant as epoch milliseconds.
    fn now_millis(&self) -> i64;
}

/// Envelope serialization
///
/// Implementations must round-trip the envelope including the null marker;
/// unknown fields in stored payloads are ignored on decode.
pub trait Codec: Send + Sync + Debug {
    /// Serialize an envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] when encoding fails.
    fn encode(&self, envelope: &ValueEnvelope) -> Result<Vec<u8>, CacheError>;

    /// Deserialize an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialization`] when the bytes are not a valid
    /// envelope.
    fn decode(&self, bytes: &[u8]) -> Result<ValueEnvelope, CacheError>;

    /// Codec name for logging.
    fn name(&self) -> &'static str;
}

/// Origin loader for a cached method
///
/// Invoked under the breakdown guard on a confirmed miss, and by the
/// pre-refresh executor near end-of-life. `Ok(None)` means the origin
/// produced no value; whether that is cached as a null marker or treated as
/// a protocol violation depends on the operation's null-caching flag.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self) -> Result<Option<Value>>;
}

/// Adapter turning an async closure into a [`Loader`].
pub struct FnLoader<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Loader for FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<Value>>> + Send,
{
    async fn load(&self) -> Result<Option<Value>> {
        (self.f)().await
    }
}

/// Wrap an async closure as a [`Loader`].
///
/// ```rust,ignore
/// let loader = loader_fn(|| async { Ok(Some(serde_json::json!({"id": 1}))) });
/// ```
pub fn loader_fn<F, Fut>(f: F) -> FnLoader<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<Value>>> + Send,
{
    FnLoader { f }
}

/// The Redis operations the engine consumes
///
/// Kept deliberately narrow so a connection-manager-backed client and an
/// in-memory test double are interchangeable. TTLs are optional: `None`
/// means the key never expires.
#[async_trait]
pub trait RedisClient: Send + Sync {
    /// Fetch raw bytes for a key, `None` on missing key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store bytes, overwriting, with an optional expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Store bytes only if the key is absent. Returns whether the write won.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool, CacheError>;

    /// Bulk delete. Returns the number of keys removed.
    async fn del_many(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Set one hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;

    /// Re-arm the expiry of a key. Returns false when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Remaining lifetime in milliseconds: −1 when eternal, −2 when missing.
    async fn pttl(&self, key: &str) -> Result<i64, CacheError>;

    /// All keys matching a glob pattern. Prefer [`Self::scan`] in production.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Cursor-based key scan matching a glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Run a Lua script with keys and string args; integer reply.
    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, CacheError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Cluster-wide mutual exclusion with lease-based auto-release
///
/// Lock keys are namespaced under `lock:` by implementations. The lease
/// bounds how long a crashed holder can wedge the key; live holders extend
/// it via heartbeat. Re-entrant within the same logical actor.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Block until the lock is held.
    async fn lock(&self, key: &str, lease: Duration) -> Result<(), CacheError>;

    /// Try to acquire within `wait`. Returns whether the lock was obtained.
    async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, CacheError>;

    /// Release. No-op unless held by the current actor.
    async fn unlock(&self, key: &str) -> Result<(), CacheError>;
}

/// Key / condition / unless expression engine
///
/// The engine does not ship an expression language; the binding layer
/// injects one. The [`KeyGenerator`] fallback covers the common case.
pub trait ExpressionEvaluator: Send + Sync {
    /// Render a key expression against the invocation.
    ///
    /// # Errors
    ///
    /// Expression engines may reject malformed expressions.
    fn render_key(&self, expression: &str, source: &KeySource) -> Result<String>;

    /// Evaluate a condition expression (cache when true).
    ///
    /// # Errors
    ///
    /// Expression engines may reject malformed expressions.
    fn eval_condition(&self, expression: &str, source: &KeySource) -> Result<bool>;

    /// Evaluate an unless expression against the loaded result (veto when
    /// true).
    ///
    /// # Errors
    ///
    /// Expression engines may reject malformed expressions.
    fn eval_unless(&self, expression: &str, source: &KeySource, result: &Value) -> Result<bool>;
}

/// Fallback key derivation when no expression is configured
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, source: &KeySource) -> String;
}
