//! Cache lifecycle events
//!
//! Every notable pipeline outcome is published as a [`CacheEvent`].
//! Delivery is best-effort: publishers must never block or fail the cache
//! operation that produced the event.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event kinds published by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEventKind {
    CacheHit,
    CacheMiss,
    CachePut,
    CacheEvict,
    CacheClear,
    CacheExpired,
    CacheError,
    PreRefreshTriggered,
}

/// One published event
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub cache: String,
    /// Rendered key, absent for cache-wide events.
    pub key: Option<String>,
    /// Short machine-readable qualifier, e.g. `"bloom"` on a rejected miss.
    pub reason: Option<String>,
    /// Publication instant, epoch milliseconds.
    pub at_ms: i64,
}

impl CacheEvent {
    #[must_use]
    pub fn new(kind: CacheEventKind, cache: impl Into<String>, at_ms: i64) -> Self {
        Self {
            kind,
            cache: cache.into(),
            key: None,
            reason: None,
            at_ms,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Best-effort event sink
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: CacheEvent);
}

/// Default publisher: structured log lines, nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: CacheEvent) {
        match event.kind {
            CacheEventKind::CacheError => {
                warn!(cache = %event.cache, key = ?event.key, reason = ?event.reason, "cache error event");
            }
            _ => {
                debug!(kind = ?event.kind, cache = %event.cache, key = ?event.key, reason = ?event.reason, "cache event");
            }
        }
    }
}

/// Publisher fanning events into an unbounded channel
///
/// The consumer side decides what to do with them; a full or dropped
/// receiver only costs a debug line.
pub struct ChannelEventPublisher {
    tx: mpsc::UnboundedSender<CacheEvent>,
}

impl ChannelEventPublisher {
    /// Create the publisher plus its receiving half.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<CacheEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventPublisher for ChannelEventPublisher {
    fn publish(&self, event: CacheEvent) {
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped; discarding cache event");
        }
    }
}
