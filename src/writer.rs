//! Cache writer handler chain
//!
//! Every cache mutation and read goes through one ordered chain of
//! handlers. Each handler declares which operations it participates in and
//! a priority; the chain is built by sorting and linking, and a handler
//! either short-circuits with a response or delegates to the rest of the
//! chain. The storage handler is terminal.
//!
//! Fixed composition, priority-ascending:
//! bloom filter → sync lock → ttl → null value → delayed double delete →
//! actual cache.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::envelope::ValueEnvelope;
use crate::error::CacheError;
use crate::events::{CacheEvent, CacheEventKind, EventPublisher};
use crate::guard::{BreakdownGuard, GuardOutcome};
use crate::key::CacheKey;
use crate::operation::CacheOperation;
use crate::store::EnvelopeStore;
use crate::traits::{Clock, Loader};
use crate::ttl::TtlPolicy;

/// Chain operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Get,
    Put,
    PutIfAbsent,
    Evict,
    Clean,
}

/// Why a read produced no value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    /// The bloom filter proved the key was never written.
    BloomRejected,
    Expired,
    /// The stored envelope was undecodable and has been evicted.
    DecodeFailure,
    /// A transient storage error was degraded to a miss.
    StorageError,
}

/// Chain outcome
#[derive(Debug)]
pub enum CacheResponse {
    Hit { envelope: ValueEnvelope },
    /// Present-but-null: the null marker was cached for this key.
    NullHit,
    Miss { reason: MissReason },
    Stored { envelope: Option<ValueEnvelope> },
    /// PUT_IF_ABSENT lost, or a null PUT without null caching.
    NotStored,
    Evicted { count: u64 },
    /// A lock-timeout fall-through load: value served, nothing cached.
    Loaded { value: Option<Value> },
}

/// One request flowing down the chain
pub struct OpRequest {
    pub op: CacheOp,
    pub key: CacheKey,
    pub operation: Arc<CacheOperation>,
    /// PUT / PUT_IF_ABSENT payload; `None` is a null write.
    pub value: Option<Value>,
    /// Origin loader for guarded GETs.
    pub loader: Option<Arc<dyn Loader>>,
    /// Effective TTL in seconds, attached by the TTL handler before writes.
    pub effective_ttl: Option<u64>,
}

impl OpRequest {
    #[must_use]
    pub fn new(op: CacheOp, key: CacheKey, operation: Arc<CacheOperation>) -> Self {
        Self {
            op,
            key,
            operation,
            value: None,
            loader: None,
            effective_ttl: None,
        }
    }
}

/// Remainder of the chain after the current handler
#[derive(Clone, Copy)]
pub struct Next<'a> {
    handlers: &'a [Arc<dyn OpHandler>],
    position: usize,
}

impl Next<'_> {
    /// Delegate to the next participating handler.
    ///
    /// # Errors
    ///
    /// Whatever the downstream handlers raise.
    pub async fn run(self, req: &mut OpRequest) -> Result<CacheResponse, CacheError> {
        let mut position = self.position;
        while let Some(handler) = self.handlers.get(position) {
            if handler.handles(req.op) {
                let next = Next {
                    handlers: self.handlers,
                    position: position + 1,
                };
                return handler.handle(req, next).await;
            }
            position += 1;
        }
        // The storage handler participates in every operation, so an
        // exhausted chain means the chain was assembled wrong.
        Err(CacheError::Transient("handler chain exhausted".to_string()))
    }
}

/// One chain element
#[async_trait]
pub trait OpHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ascending execution order.
    fn priority(&self) -> i32;

    /// Operation mask.
    fn handles(&self, op: CacheOp) -> bool;

    async fn handle(
        &self,
        req: &mut OpRequest,
        next: Next<'_>,
    ) -> Result<CacheResponse, CacheError>;
}

/// The assembled chain
pub struct CacheWriter {
    handlers: Vec<Arc<dyn OpHandler>>,
}

impl CacheWriter {
    /// Sort by priority and link.
    #[must_use]
    pub fn new(mut handlers: Vec<Arc<dyn OpHandler>>) -> Self {
        handlers.sort_by_key(|h| h.priority());
        Self { handlers }
    }

    /// Run a request through the chain.
    ///
    /// # Errors
    ///
    /// Handler failures propagate; only the storage handler may degrade a
    /// read failure to a miss.
    pub async fn execute(&self, req: &mut OpRequest) -> Result<CacheResponse, CacheError> {
        Next {
            handlers: &self.handlers,
            position: 0,
        }
        .run(req)
        .await
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Penetration gate + filter maintenance
pub struct BloomHandler {
    bloom: Arc<BloomFilter>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl BloomHandler {
    #[must_use]
    pub fn new(
        bloom: Arc<BloomFilter>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { bloom, events, clock }
    }
}

#[async_trait]
impl OpHandler for BloomHandler {
    fn name(&self) -> &'static str {
        "bloom-filter"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn handles(&self, _op: CacheOp) -> bool {
        true
    }

    async fn handle(
        &self,
        req: &mut OpRequest,
        next: Next<'_>,
    ) -> Result<CacheResponse, CacheError> {
        if !req.operation.use_bloom_filter {
            return next.run(req).await;
        }
        match req.op {
            CacheOp::Get => {
                if !self
                    .bloom
                    .might_contain(req.key.cache_name(), req.key.rendered())
                    .await
                {
                    self.events.publish(
                        CacheEvent::new(
                            CacheEventKind::CacheMiss,
                            req.key.cache_name(),
                            self.clock.now_millis(),
                        )
                        .with_key(req.key.rendered())
                        .with_reason("bloom"),
                    );
                    debug!(key = %req.key, "bloom rejected read");
                    return Ok(CacheResponse::Miss {
                        reason: MissReason::BloomRejected,
                    });
                }
                next.run(req).await
            }
            CacheOp::Put | CacheOp::PutIfAbsent => {
                let response = next.run(req).await?;
                // The filter records a key only after its write succeeded.
                if matches!(response, CacheResponse::Stored { .. }) {
                    self.bloom
                        .add(req.key.cache_name(), req.key.rendered())
                        .await;
                }
                Ok(response)
            }
            CacheOp::Evict => next.run(req).await,
            CacheOp::Clean => {
                let response = next.run(req).await?;
                self.bloom.clear(req.key.cache_name()).await;
                Ok(response)
            }
        }
    }
}

/// Breakdown guard wrapper for coordinated reads
pub struct SyncLockHandler {
    guard: Arc<BreakdownGuard>,
}

impl SyncLockHandler {
    #[must_use]
    pub fn new(guard: Arc<BreakdownGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl OpHandler for SyncLockHandler {
    fn name(&self) -> &'static str {
        "sync-lock"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn handles(&self, op: CacheOp) -> bool {
        op == CacheOp::Get
    }

    async fn handle(
        &self,
        req: &mut OpRequest,
        next: Next<'_>,
    ) -> Result<CacheResponse, CacheError> {
        let Some(loader) = req.loader.clone() else {
            return next.run(req).await;
        };
        if !req.operation.needs_load_guard() {
            return next.run(req).await;
        }

        // The guard owns the whole triple-checked read: its first unlocked
        // check replaces the plain storage read for this request.
        match self
            .guard
            .load_through(&req.key, &req.operation, loader.as_ref())
            .await?
        {
            GuardOutcome::Envelope(envelope) if envelope.is_null_marker() => {
                Ok(CacheResponse::NullHit)
            }
            GuardOutcome::Envelope(envelope) => Ok(CacheResponse::Hit { envelope }),
            GuardOutcome::Uncached(value) => Ok(CacheResponse::Loaded { value }),
        }
    }
}

/// Attaches the effective (possibly jittered) TTL to writes
pub struct TtlHandler {
    policy: Arc<TtlPolicy>,
}

impl TtlHandler {
    #[must_use]
    pub fn new(policy: Arc<TtlPolicy>) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl OpHandler for TtlHandler {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn handles(&self, op: CacheOp) -> bool {
        matches!(op, CacheOp::Put | CacheOp::PutIfAbsent)
    }

    async fn handle(
        &self,
        req: &mut OpRequest,
        next: Next<'_>,
    ) -> Result<CacheResponse, CacheError> {
        let op = &req.operation;
        req.effective_ttl = Some(
            self.policy
                .final_ttl(op.ttl_seconds, op.random_ttl, op.variance),
        );
        next.run(req).await
    }
}

/// Null-caching policy
///
/// On writes: a null payload either becomes the null marker with a short
/// TTL or is dropped. On reads: a decoded null marker surfaces as
/// "present but null".
pub struct NullValueHandler;

/// Ceiling for null-marker TTLs, seconds.
const NULL_TTL_CAP: u64 = 60;

#[async_trait]
impl OpHandler for NullValueHandler {
    fn name(&self) -> &'static str {
        "null-value"
    }

    fn priority(&self) -> i32 {
        40
    }

    fn handles(&self, op: CacheOp) -> bool {
        matches!(op, CacheOp::Get | CacheOp::Put | CacheOp::PutIfAbsent)
    }

    async fn handle(
        &self,
        req: &mut OpRequest,
        next: Next<'_>,
    ) -> Result<CacheResponse, CacheError> {
        match req.op {
            CacheOp::Get => {
                let response = next.run(req).await?;
                match response {
                    CacheResponse::Hit { envelope } if envelope.is_null_marker() => {
                        Ok(CacheResponse::NullHit)
                    }
                    other => Ok(other),
                }
            }
            _ if req.value.is_none() => {
                if !req.operation.cache_null_values {
                    debug!(key = %req.key, "null result not cached (null caching disabled)");
                    return Ok(CacheResponse::NotStored);
                }
                req.effective_ttl = Some(match req.effective_ttl {
                    Some(ttl) if ttl > 0 => ttl.min(NULL_TTL_CAP),
                    _ => NULL_TTL_CAP,
                });
                next.run(req).await
            }
            _ => next.run(req).await,
        }
    }
}

/// Second delete pass closing the stale-read window
///
/// After the synchronous delete completes, the same delete runs again
/// `delay_ms` later from a detached task. Best-effort by design: the delay
/// is a heuristic against in-flight readers re-populating stale data.
pub struct DoubleDeleteHandler {
    store: Arc<EnvelopeStore>,
    delay_ms: Option<u64>,
}

impl DoubleDeleteHandler {
    #[must_use]
    pub fn new(store: Arc<EnvelopeStore>, delay_ms: Option<u64>) -> Self {
        Self { store, delay_ms }
    }
}

#[async_trait]
impl OpHandler for DoubleDeleteHandler {
    fn name(&self) -> &'static str {
        "double-delete"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn handles(&self, op: CacheOp) -> bool {
        matches!(op, CacheOp::Evict | CacheOp::Clean)
    }

    async fn handle(
        &self,
        req: &mut OpRequest,
        next: Next<'_>,
    ) -> Result<CacheResponse, CacheError> {
        let response = next.run(req).await?;
        if let Some(delay_ms) = self.delay_ms {
            let store = self.store.clone();
            let op = req.op;
            let key = req.key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                let outcome = match op {
                    CacheOp::Evict => store.delete(&key).await.map(u64::from),
                    _ => store.delete_all(key.cache_name()).await,
                };
                match outcome {
                    Ok(count) => debug!(key = %key, count, "second delete pass done"),
                    Err(e) => warn!(key = %key, error = %e, "second delete pass failed"),
                }
            });
        }
        Ok(response)
    }
}

/// Terminal handler: the actual Redis reads and writes
pub struct StorageHandler {
    store: Arc<EnvelopeStore>,
    policy: Arc<TtlPolicy>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl StorageHandler {
    #[must_use]
    pub fn new(
        store: Arc<EnvelopeStore>,
        policy: Arc<TtlPolicy>,
        events: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy,
            events,
            clock,
        }
    }

    fn event(&self, kind: CacheEventKind, key: &CacheKey) -> CacheEvent {
        CacheEvent::new(kind, key.cache_name(), self.clock.now_millis()).with_key(key.rendered())
    }

    async fn read(&self, req: &OpRequest) -> Result<CacheResponse, CacheError> {
        let envelope = match self.store.read(&req.key).await {
            Ok(env) => env,
            Err(e) if e.degrades_to_miss() => {
                // The storage handler alone may swallow a read failure.
                warn!(key = %req.key, error = %e, "read degraded to miss");
                self.events
                    .publish(self.event(CacheEventKind::CacheError, &req.key).with_reason(e.to_string()));
                let reason = if matches!(e, CacheError::Serialization { .. }) {
                    MissReason::DecodeFailure
                } else {
                    MissReason::StorageError
                };
                return Ok(CacheResponse::Miss { reason });
            }
            Err(e) => return Err(e),
        };

        let Some(mut envelope) = envelope else {
            return Ok(CacheResponse::Miss {
                reason: MissReason::NotFound,
            });
        };

        if self
            .policy
            .is_expired(envelope.created_time, envelope.storage_ttl_seconds().unwrap_or(0))
        {
            self.events
                .publish(self.event(CacheEventKind::CacheExpired, &req.key));
            let _ = self.store.delete(&req.key).await;
            return Ok(CacheResponse::Miss {
                reason: MissReason::Expired,
            });
        }

        self.store.touch(&req.key, &mut envelope).await;
        Ok(CacheResponse::Hit { envelope })
    }

    async fn write(&self, req: &OpRequest) -> Result<CacheResponse, CacheError> {
        let ttl = req.effective_ttl.unwrap_or(req.operation.ttl_seconds);
        let envelope = match &req.value {
            Some(value) => {
                self.store
                    .write(&req.key, value.clone(), &req.operation.return_type, ttl)
                    .await?
            }
            None => self.store.write_null(&req.key, ttl).await?,
        };
        self.events
            .publish(self.event(CacheEventKind::CachePut, &req.key));
        Ok(CacheResponse::Stored {
            envelope: Some(envelope),
        })
    }

    async fn write_if_absent(&self, req: &OpRequest) -> Result<CacheResponse, CacheError> {
        let ttl = req.effective_ttl.unwrap_or(req.operation.ttl_seconds);
        let (value, type_name) = match &req.value {
            Some(value) => (value.clone(), req.operation.return_type.as_str()),
            None => (Value::Null, crate::envelope::NULL_MARKER_TYPE),
        };
        let stored = self
            .store
            .write_if_absent(&req.key, value, type_name, ttl)
            .await?;
        if stored {
            self.events
                .publish(self.event(CacheEventKind::CachePut, &req.key));
            Ok(CacheResponse::Stored { envelope: None })
        } else {
            Ok(CacheResponse::NotStored)
        }
    }
}

#[async_trait]
impl OpHandler for StorageHandler {
    fn name(&self) -> &'static str {
        "actual-cache"
    }

    fn priority(&self) -> i32 {
        60
    }

    fn handles(&self, _op: CacheOp) -> bool {
        true
    }

    async fn handle(
        &self,
        req: &mut OpRequest,
        _next: Next<'_>,
    ) -> Result<CacheResponse, CacheError> {
        match req.op {
            CacheOp::Get => self.read(req).await,
            CacheOp::Put => self.write(req).await,
            CacheOp::PutIfAbsent => self.write_if_absent(req).await,
            CacheOp::Evict => {
                let existed = self.store.delete(&req.key).await?;
                self.events
                    .publish(self.event(CacheEventKind::CacheEvict, &req.key));
                Ok(CacheResponse::Evicted {
                    count: u64::from(existed),
                })
            }
            CacheOp::Clean => {
                let count = self.store.delete_all(req.key.cache_name()).await?;
                self.events.publish(
                    CacheEvent::new(
                        CacheEventKind::CacheClear,
                        req.key.cache_name(),
                        self.clock.now_millis(),
                    ),
                );
                Ok(CacheResponse::Evicted { count })
            }
        }
    }
}
