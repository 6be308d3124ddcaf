//! Keyed lock pool with two-list eviction
//!
//! A bounded directory of per-key async locks. References live on an
//! active list and an inactive list: hits touch and re-front, inactive hits
//! promote, and overflowing active entries cascade to the inactive head.
//! Only references that are neither held nor waited on are ever discarded,
//! so the pool may transiently exceed its soft bounds rather than lose a
//! live lock.
//!
//! The pool mutex covers bookkeeping only; callers acquire the per-key
//! mutex outside it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::config::LockPoolConfig;
use crate::error::CacheError;
use crate::traits::Clock;

/// One keyed lock plus its eviction bookkeeping
pub struct LockReference {
    mutex: Arc<tokio::sync::Mutex<()>>,
    held: AtomicBool,
    waiters: AtomicUsize,
    last_used_ms: AtomicI64,
}

impl LockReference {
    fn new(now_ms: i64) -> Self {
        Self {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            held: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            last_used_ms: AtomicI64::new(now_ms),
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }

    /// A reference may be discarded only when nobody holds or awaits it.
    #[must_use]
    pub fn can_evict(&self) -> bool {
        !self.is_locked() && !self.has_waiters()
    }

    #[must_use]
    pub fn last_used_ms(&self) -> i64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    fn touch(&self, now_ms: i64) {
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Held lock returned by [`LockPool::try_acquire`]
///
/// `release` is idempotent; dropping the handle releases too.
pub struct LockHandle {
    guard: Option<OwnedMutexGuard<()>>,
    reference: Arc<LockReference>,
}

impl LockHandle {
    /// Release the lock. Further calls are no-ops.
    pub fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            // Flip the flag before the guard drops so a waiter that wakes
            // immediately cannot have its own `held` overwritten.
            self.reference.held.store(false, Ordering::SeqCst);
            drop(guard);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

struct PoolState {
    refs: HashMap<String, Arc<LockReference>>,
    /// Most recently used at the front.
    active: VecDeque<String>,
    /// Most recently demoted at the front.
    inactive: VecDeque<String>,
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Copy)]
pub struct LockPoolSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub active_size: usize,
    pub inactive_size: usize,
    /// Active occupancy against the configured bound.
    pub utilization: f64,
    /// Rough retained-memory estimate for the directory.
    pub estimated_bytes: usize,
}

/// Bounded per-key lock directory
pub struct LockPool {
    config: LockPoolConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
    counters: PoolCounters,
}

impl LockPool {
    #[must_use]
    pub fn new(config: LockPoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(PoolState {
                refs: HashMap::new(),
                active: VecDeque::new(),
                inactive: VecDeque::new(),
            }),
            counters: PoolCounters::default(),
        }
    }

    /// Look up or create the lock reference for a key.
    ///
    /// Active hits re-front; inactive hits promote to the active head; a
    /// miss inserts at the active head. Either promotion may cascade the
    /// active tail onto the inactive head and trim the inactive overflow.
    pub fn reference(&self, key: &str) -> Arc<LockReference> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if let Some(existing) = state.refs.get(key).cloned() {
            existing.touch(now);
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            if state.active.iter().any(|k| k == key) {
                state.active.retain(|k| k != key);
                state.active.push_front(key.to_string());
            } else {
                state.inactive.retain(|k| k != key);
                state.active.push_front(key.to_string());
                self.rebalance(&mut state);
            }
            return existing;
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let created = Arc::new(LockReference::new(now));
        state.refs.insert(key.to_string(), created.clone());
        state.active.push_front(key.to_string());
        self.rebalance(&mut state);
        created
    }

    /// Demote active overflow, then trim inactive overflow.
    ///
    /// Trimming skips references that are held or waited on; when nothing
    /// is evictable the lists stay over their soft bounds.
    fn rebalance(&self, state: &mut PoolState) {
        while state.active.len() > self.config.max_active {
            if let Some(demoted) = state.active.pop_back() {
                state.inactive.push_front(demoted);
            }
        }

        while state.inactive.len() > self.config.max_inactive {
            let victim_pos = state
                .inactive
                .iter()
                .rposition(|k| state.refs.get(k).is_some_and(|r| r.can_evict()));
            let Some(pos) = victim_pos else {
                break; // nothing evictable; exceed the soft bound
            };
            if let Some(victim) = state.inactive.remove(pos) {
                state.refs.remove(&victim);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %victim, "evicted idle lock reference");
            }
        }
    }

    /// Acquire the keyed lock, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`CacheError::LockTimeout`] when the wait expires; the lock is left
    /// untouched in that case.
    pub async fn try_acquire(&self, key: &str, timeout: Duration) -> Result<LockHandle, CacheError> {
        let reference = self.reference(key);
        reference.waiters.fetch_add(1, Ordering::SeqCst);
        let acquired =
            tokio::time::timeout(timeout, reference.mutex.clone().lock_owned()).await;
        reference.waiters.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Ok(guard) => {
                reference.held.store(true, Ordering::SeqCst);
                reference.touch(self.clock.now_millis());
                Ok(LockHandle {
                    guard: Some(guard),
                    reference,
                })
            }
            Err(_) => Err(CacheError::LockTimeout {
                key: key.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Acquire with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`Self::try_acquire`].
    pub async fn acquire(&self, key: &str) -> Result<LockHandle, CacheError> {
        self.try_acquire(key, Duration::from_secs(self.config.acquire_timeout_secs))
            .await
    }

    /// Drop evictable references idle for longer than `max_idle_ms`.
    ///
    /// Called by the maintenance sweep. Returns the number evicted.
    pub fn evict_idle(&self, max_idle_ms: u64) -> usize {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(i64::try_from(max_idle_ms).unwrap_or(i64::MAX));
        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .refs
            .iter()
            .filter(|(_, r)| r.can_evict() && r.last_used_ms() < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.refs.remove(key);
            state.active.retain(|k| k != key);
            state.inactive.retain(|k| k != key);
        }
        let evicted = stale.len();
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            debug!(count = evicted, "idle sweep evicted lock references");
        }
        evicted
    }

    #[must_use]
    pub fn snapshot(&self) -> LockPoolSnapshot {
        let state = self.state.lock();
        let active_size = state.active.len();
        #[allow(clippy::cast_precision_loss)]
        let utilization = if self.config.max_active > 0 {
            active_size as f64 / self.config.max_active as f64
        } else {
            0.0
        };
        // Key string + reference + list slots, coarse but stable.
        let per_entry = std::mem::size_of::<LockReference>() + 96;
        LockPoolSnapshot {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            active_size,
            inactive_size: state.inactive.len(),
            utilization,
            estimated_bytes: state.refs.len() * per_entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn tiny_pool(max_active: usize, max_inactive: usize) -> LockPool {
        LockPool::new(
            LockPoolConfig {
                max_active,
                max_inactive,
                acquire_timeout_secs: 1,
            },
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_key() {
        let pool = Arc::new(tiny_pool(16, 16));
        let first = pool.try_acquire("k", Duration::from_millis(200)).await.unwrap();

        let err = pool.try_acquire("k", Duration::from_millis(50)).await;
        assert!(matches!(err, Err(CacheError::LockTimeout { .. })));

        drop(first);
        assert!(pool.try_acquire("k", Duration::from_millis(200)).await.is_ok());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let pool = tiny_pool(16, 16);
        let _a = pool.try_acquire("a", Duration::from_millis(100)).await.unwrap();
        let _b = pool.try_acquire("b", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = tiny_pool(16, 16);
        let mut handle = pool.try_acquire("k", Duration::from_millis(100)).await.unwrap();
        handle.release();
        handle.release();
        handle.release();
        assert!(pool.try_acquire("k", Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn held_locks_survive_overflow() {
        let pool = tiny_pool(1, 1);
        let held = pool.try_acquire("hot", Duration::from_millis(100)).await.unwrap();

        // Push enough keys through to force "hot" off both lists.
        for i in 0..16 {
            let _ = pool.reference(&format!("cold:{i}"));
        }

        // The held reference must still be the same lock: a second acquire
        // on "hot" has to time out against the live holder.
        let err = pool.try_acquire("hot", Duration::from_millis(50)).await;
        assert!(matches!(err, Err(CacheError::LockTimeout { .. })));
        drop(held);
    }

    #[tokio::test]
    async fn idle_references_are_evicted_on_overflow() {
        let pool = tiny_pool(2, 2);
        for i in 0..10 {
            let _ = pool.reference(&format!("k:{i}"));
        }
        let snapshot = pool.snapshot();
        assert!(snapshot.evictions > 0);
        assert!(snapshot.active_size <= 2);
        assert!(snapshot.inactive_size <= 2);
    }

    #[tokio::test]
    async fn inactive_hit_promotes_to_active() {
        let pool = tiny_pool(1, 4);
        let _ = pool.reference("a"); // active: [a]
        let _ = pool.reference("b"); // a demoted to inactive
        let again = pool.reference("a"); // promoted back
        assert!(again.can_evict());
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active_size, 1);
        assert!(snapshot.hits >= 1);
    }

    #[tokio::test]
    async fn idle_sweep_respects_holders() {
        let clock = Arc::new(ManualClock::new(0));
        let pool = LockPool::new(
            LockPoolConfig {
                max_active: 8,
                max_inactive: 8,
                acquire_timeout_secs: 1,
            },
            clock.clone(),
        );
        let held = pool.try_acquire("busy", Duration::from_millis(100)).await.unwrap();
        let _ = pool.reference("idle");

        clock.advance(10_000);
        let evicted = pool.evict_idle(1_000);
        assert_eq!(evicted, 1); // only "idle"

        drop(held);
        clock.advance(10_000);
        assert_eq!(pool.evict_idle(1_000), 1);
    }

    #[tokio::test]
    async fn snapshot_reports_utilization() {
        let pool = tiny_pool(4, 4);
        let _ = pool.reference("a");
        let _ = pool.reference("b");
        let snapshot = pool.snapshot();
        assert!((snapshot.utilization - 0.5).abs() < f64::EPSILON);
        assert!(snapshot.estimated_bytes > 0);
    }
}
