//! Pre-refresh executor
//!
//! Bounded worker pool for asynchronous refreshes. Submissions are
//! deduplicated per key: while a refresh for a key is in flight, further
//! submissions for it are dropped — the in-flight result is fresh enough.
//! Queued-but-not-started tasks can be cancelled by key; running tasks
//! always finish. Shutdown drains with a bounded grace period, then
//! forcibly cancels whatever is left.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CacheError;

struct RefreshTask {
    handle: JoinHandle<()>,
    started: Arc<AtomicBool>,
}

/// Removes the in-flight entry when the task finishes, however it finishes.
struct InFlightCleanup {
    map: Arc<DashMap<String, RefreshTask>>,
    key: String,
}

impl Drop for InFlightCleanup {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Shared between the executor and its spawned tasks.
#[derive(Debug, Default)]
struct RefreshCounters {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time executor statistics
#[derive(Debug, Clone, Copy)]
pub struct RefreshStatsSnapshot {
    pub submitted: u64,
    pub deduplicated: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub in_flight: usize,
}

/// Bounded, key-deduplicated refresh pool
pub struct RefreshExecutor {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, RefreshTask>>,
    counters: Arc<RefreshCounters>,
    accepting: AtomicBool,
    grace: Duration,
}

impl RefreshExecutor {
    #[must_use]
    pub fn new(max_workers: usize, shutdown_grace: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            in_flight: Arc::new(DashMap::new()),
            counters: Arc::new(RefreshCounters::default()),
            accepting: AtomicBool::new(true),
            grace: shutdown_grace,
        }
    }

    /// Submit a refresh for `key`. Returns immediately.
    ///
    /// Returns `false` when dropped: a refresh for the key is already in
    /// flight, or the executor is shutting down.
    pub fn submit<F>(&self, key: &str, work: F) -> bool
    where
        F: std::future::Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }

        let entry = self.in_flight.entry(key.to_string());
        let dashmap::mapref::entry::Entry::Vacant(slot) = entry else {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "refresh already in flight; submission dropped");
            return false;
        };

        let started = Arc::new(AtomicBool::new(false));
        // The task must not outrun its own registration: it waits for the
        // ready signal sent after the entry is inserted.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let cleanup = InFlightCleanup {
            map: self.in_flight.clone(),
            key: key.to_string(),
        };
        let semaphore = self.semaphore.clone();
        let counters = self.counters.clone();
        let task_started = started.clone();
        let key_owned = key.to_string();

        let handle = tokio::spawn(async move {
            let _cleanup = cleanup;
            if ready_rx.await.is_err() {
                return;
            }
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return; // executor torn down
            };
            task_started.store(true, Ordering::SeqCst);
            match work.await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key_owned, "refresh completed");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key_owned, error = %e, "refresh failed; stale value retained");
                }
            }
        });

        slot.insert(RefreshTask { handle, started });
        let _ = ready_tx.send(());
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Cancel a refresh that has not started running yet.
    ///
    /// Running refreshes are left to finish. Returns whether a queued task
    /// was cancelled.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .in_flight
            .remove_if(key, |_, task| !task.started.load(Ordering::SeqCst));
        match removed {
            Some((_, task)) => {
                task.handle.abort();
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "queued refresh cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a refresh for `key` is queued or running.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Stop accepting work, drain up to the grace period, then abort.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.grace;
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let leftover: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for key in leftover {
            if let Some((_, task)) = self.in_flight.remove(&key) {
                task.handle.abort();
                warn!(key = %key, "refresh aborted at shutdown");
            }
        }
        info!("pre-refresh executor drained");
    }

    #[must_use]
    pub fn stats(&self) -> RefreshStatsSnapshot {
        RefreshStatsSnapshot {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn executor(workers: usize) -> RefreshExecutor {
        RefreshExecutor::new(workers, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn submissions_for_one_key_are_deduplicated() {
        let executor = executor(1);
        let runs = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let first_runs = runs.clone();
        let first_gate = gate.clone();
        assert!(executor.submit("users::1", async move {
            first_gate.notified().await;
            first_runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        // While the first is in flight, everything else is dropped.
        for _ in 0..5 {
            let extra = runs.clone();
            assert!(!executor.submit("users::1", async move {
                extra.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(executor.stats().deduplicated, 5);
        assert!(!executor.is_in_flight("users::1"));
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let executor = executor(4);
        let runs = Arc::new(AtomicU32::new(0));
        for i in 0..4 {
            let runs = runs.clone();
            assert!(executor.submit(&format!("users::{i}"), async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(executor.stats().completed, 4);
    }

    #[tokio::test]
    async fn queued_tasks_can_be_cancelled() {
        let executor = executor(1);
        let gate = Arc::new(tokio::sync::Notify::new());
        let ran = Arc::new(AtomicU32::new(0));

        let blocker_gate = gate.clone();
        executor.submit("busy", async move {
            blocker_gate.notified().await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // With one worker busy, this one stays queued behind the semaphore.
        let queued_ran = ran.clone();
        executor.submit("queued", async move {
            queued_ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(executor.cancel("queued"));

        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(executor.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn running_tasks_are_not_cancelled() {
        let executor = executor(1);
        let gate = Arc::new(tokio::sync::Notify::new());
        let task_gate = gate.clone();
        executor.submit("running", async move {
            task_gate.notified().await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!executor.cancel("running"));
        gate.notify_waiters();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let executor = executor(1);
        executor.shutdown().await;
        assert!(!executor.submit("late", async { Ok(()) }));
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let executor = executor(1);
        executor.submit("flaky", async { Err(CacheError::Transient("origin down".into())) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.stats().failed, 1);
    }
}
