//! Common utilities for integration tests
//!
//! Provides an in-memory Redis double implementing the engine's
//! `RedisClient` contract, a hand-driven clock, counting loaders, and
//! test data builders. Everything the engine touches is injected, so these
//! tests run without a Redis server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use cache_shield::clock::ManualClock;
use cache_shield::error::CacheError;
use cache_shield::traits::{Loader, RedisClient};
use cache_shield::{CacheShield, ChannelEventPublisher, CacheEvent};
use tokio::sync::mpsc::UnboundedReceiver;

struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-memory Redis double
///
/// Implements the string, hash and script operations the engine uses,
/// with real-time TTL expiry and per-operation counters so tests can
/// observe traffic (e.g. the second delete pass).
#[derive(Default)]
pub struct MockRedis {
    values: DashMap<String, StoredValue>,
    hashes: DashMap<String, HashMap<String, String>>,
    pub del_calls: DashMap<String, u64>,
    pub del_many_calls: AtomicU64,
    pub scan_calls: AtomicU64,
    pub set_calls: AtomicU64,
}

impl MockRedis {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Remaining real-time TTL of a key, for assertions.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.values
            .get(key)
            .filter(|v| v.live())
            .and_then(|v| v.expires_at.map(|at| at.saturating_duration_since(Instant::now())))
    }

    /// Raw stored bytes, for envelope-level assertions.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values
            .get(key)
            .filter(|v| v.live())
            .map(|v| v.bytes.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.get(key).is_some_and(|v| v.live())
    }

    fn expires(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|d| Instant::now() + d)
    }

    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl RedisClient for MockRedis {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        // Copy out before mutating: holding a map ref across remove() would
        // self-deadlock the shard.
        let snapshot = self.values.get(key).map(|e| (e.live(), e.bytes.clone()));
        match snapshot {
            Some((true, bytes)) => Ok(Some(bytes)),
            Some((false, _)) => {
                self.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.values.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Self::expires(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut won = false;
        let entry = self.values.entry(key.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut slot) if !slot.get().live() => {
                slot.insert(StoredValue {
                    bytes: value.to_vec(),
                    expires_at: Self::expires(ttl),
                });
                won = true;
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {}
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(StoredValue {
                    bytes: value.to_vec(),
                    expires_at: Self::expires(ttl),
                });
                won = true;
            }
        }
        Ok(won)
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        *self.del_calls.entry(key.to_string()).or_insert(0) += 1;
        let existed = self.values.remove(key).is_some() || self.hashes.remove(key).is_some();
        Ok(existed)
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        self.del_many_calls.fetch_add(1, Ordering::SeqCst);
        let mut removed = 0;
        for key in keys {
            if self.values.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        Ok(self.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        match self.values.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        match self.values.get(key) {
            Some(entry) if entry.live() => Ok(entry.expires_at.map_or(-1, |at| {
                i64::try_from(at.saturating_duration_since(Instant::now()).as_millis())
                    .unwrap_or(i64::MAX)
            })),
            _ => Ok(-2),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        Ok(self
            .values
            .iter()
            .filter(|e| e.value().live() && Self::matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        self.keys(pattern).await
    }

    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, CacheError> {
        // Emulates the two lock scripts: compare-and-delete and
        // compare-and-extend.
        let key = keys.first().cloned().unwrap_or_default();
        let token = args.first().cloned().unwrap_or_default();
        let matches = self
            .values
            .get(&key)
            .is_some_and(|v| v.live() && v.bytes == token.as_bytes());
        if !matches {
            return Ok(0);
        }
        if script.contains("del") {
            self.values.remove(&key);
        } else if script.contains("pexpire") {
            if let (Some(mut entry), Some(ms)) = (
                self.values.get_mut(&key),
                args.get(1).and_then(|a| a.parse::<u64>().ok()),
            ) {
                entry.expires_at = Some(Instant::now() + Duration::from_millis(ms));
            }
        }
        Ok(1)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Loader that counts its invocations and can simulate origin latency
pub struct CountingLoader {
    calls: AtomicU32,
    value: Option<Value>,
    delay: Duration,
}

impl CountingLoader {
    pub fn returning(value: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            value: Some(value),
            delay: Duration::ZERO,
        })
    }

    pub fn returning_null() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            value: None,
            delay: Duration::ZERO,
        })
    }

    pub fn slow(value: Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            value: Some(value),
            delay,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for CountingLoader {
    async fn load(&self) -> anyhow::Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.value.clone())
    }
}

/// Loader whose value changes on every call (distinguishes refreshes)
pub struct SequenceLoader {
    calls: AtomicU32,
}

impl SequenceLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for SequenceLoader {
    async fn load(&self) -> anyhow::Result<Option<Value>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(serde_json::json!({ "generation": n })))
    }
}

/// Engine wired to the mock Redis and a manual clock
pub struct TestShield {
    pub shield: CacheShield,
    pub redis: Arc<MockRedis>,
    pub clock: Arc<ManualClock>,
    pub events: UnboundedReceiver<CacheEvent>,
}

static TRACING: std::sync::Once = std::sync::Once::new();

/// Opt into log output with `RUST_LOG=cache_shield=debug cargo test`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub async fn test_shield() -> TestShield {
    test_shield_with_config(cache_shield::config::ShieldConfig::default()).await
}

pub async fn test_shield_with_config(config: cache_shield::config::ShieldConfig) -> TestShield {
    init_tracing();
    let redis = MockRedis::new();
    let clock = Arc::new(ManualClock::new(0));
    let (publisher, events) = ChannelEventPublisher::channel();
    let shield = CacheShield::builder()
        .config(config)
        .redis_client(redis.clone())
        .clock(clock.clone())
        .events(publisher)
        .build()
        .await
        .unwrap_or_else(|e| panic!("failed to build test shield: {e}"));
    TestShield {
        shield,
        redis,
        clock,
        events,
    }
}

/// Drain currently buffered events into a vector.
pub fn drain_events(rx: &mut UnboundedReceiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Generate test data of various types
pub mod test_data {
    use serde_json::{Value, json};

    pub fn user(id: u64, name: &str) -> Value {
        json!({
            "id": id,
            "name": name,
            "email": format!("{}@example.com", name.to_lowercase()),
        })
    }

    pub fn product(id: u64) -> Value {
        json!({
            "id": id,
            "name": format!("Product {id}"),
            "price": 99.99 + id as f64,
        })
    }
}
