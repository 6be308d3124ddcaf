//! Redis lease lock
//!
//! Cluster-wide mutual exclusion under `lock:<name>` keys. Each engine
//! instance is one logical actor identified by a UUID token; acquisition is
//! `SET NX PX`, release and lease extension are compare-and-mutate scripts
//! so only the holding actor can touch the key. A heartbeat task extends
//! the lease while held, and the lease itself bounds how long a crashed
//! holder can wedge the lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheError;
use crate::traits::{DistributedLock, RedisClient};

/// Namespace for distributed lock keys.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Delete only when the stored token is ours.
const UNLOCK_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Extend the lease only when the stored token is ours.
const EXTEND_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('pexpire', KEYS[1], ARGV[2]) else return 0 end";

/// Retry pause between acquisition attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

struct Hold {
    count: u32,
    heartbeat: JoinHandle<()>,
}

/// Lease-based distributed lock on Redis
pub struct RedisLeaseLock {
    redis: Arc<dyn RedisClient>,
    actor: String,
    holds: DashMap<String, Hold>,
}

impl RedisLeaseLock {
    #[must_use]
    pub fn new(redis: Arc<dyn RedisClient>) -> Self {
        Self {
            redis,
            actor: Uuid::new_v4().to_string(),
            holds: DashMap::new(),
        }
    }

    /// This instance's actor token (stable for its lifetime).
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    fn lock_key(name: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{name}")
    }

    fn spawn_heartbeat(&self, lock_key: String, lease: Duration) -> JoinHandle<()> {
        let redis = self.redis.clone();
        let actor = self.actor.clone();
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let interval = lease / 3;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match redis
                    .eval(
                        EXTEND_SCRIPT,
                        std::slice::from_ref(&lock_key),
                        &[actor.clone(), lease_ms.to_string()],
                    )
                    .await
                {
                    Ok(1) => debug!(key = %lock_key, "lease extended"),
                    Ok(_) => {
                        warn!(key = %lock_key, "lease lost; stopping heartbeat");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %lock_key, error = %e, "lease extension failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl DistributedLock for RedisLeaseLock {
    async fn lock(&self, key: &str, lease: Duration) -> Result<(), CacheError> {
        loop {
            if self.try_lock(key, Duration::from_secs(30), lease).await? {
                return Ok(());
            }
        }
    }

    async fn try_lock(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, CacheError> {
        let lock_key = Self::lock_key(key);

        // Re-entrant within this actor.
        if let Some(mut hold) = self.holds.get_mut(&lock_key) {
            hold.count += 1;
            return Ok(true);
        }

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let won = self
                .redis
                .set_if_absent(&lock_key, self.actor.as_bytes(), Some(lease))
                .await?;
            if won {
                let heartbeat = self.spawn_heartbeat(lock_key.clone(), lease);
                self.holds.insert(lock_key.clone(), Hold { count: 1, heartbeat });
                debug!(key = %lock_key, "distributed lock acquired");
                return Ok(true);
            }

            // Another task of this actor may have won the race meanwhile.
            if let Some(mut hold) = self.holds.get_mut(&lock_key) {
                hold.count += 1;
                return Ok(true);
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    }

    async fn unlock(&self, key: &str) -> Result<(), CacheError> {
        let lock_key = Self::lock_key(key);

        let remaining = match self.holds.get_mut(&lock_key) {
            Some(mut hold) => {
                hold.count = hold.count.saturating_sub(1);
                hold.count
            }
            None => return Ok(()), // not held by this actor
        };

        if remaining == 0 {
            if let Some((_, hold)) = self.holds.remove(&lock_key) {
                hold.heartbeat.abort();
                let released = self
                    .redis
                    .eval(
                        UNLOCK_SCRIPT,
                        std::slice::from_ref(&lock_key),
                        std::slice::from_ref(&self.actor),
                    )
                    .await?;
                if released == 1 {
                    debug!(key = %lock_key, "distributed lock released");
                } else {
                    warn!(key = %lock_key, "lock already expired or taken over at release");
                }
            }
        }
        Ok(())
    }
}

/// Run `f` under the distributed lock, always releasing afterwards.
///
/// The release happens whether `f` succeeds or fails; a release failure is
/// logged but never masks `f`'s own outcome.
///
/// # Errors
///
/// Propagates acquisition failures and `f`'s error.
pub async fn with_lock<T, F, Fut>(
    lock: &dyn DistributedLock,
    key: &str,
    lease: Duration,
    f: F,
) -> Result<T, CacheError>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, CacheError>> + Send,
{
    lock.lock(key, lease).await?;
    let result = f().await;
    if let Err(e) = lock.unlock(key).await {
        warn!(key = %key, error = %e, "failed to release distributed lock");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use parking_lot::Mutex;

    /// Minimal Redis fake covering SET NX PX and the two lock scripts.
    #[derive(Default)]
    struct LockStub {
        values: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl RedisClient for LockStub {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Ok(self.values.lock().get(key).cloned())
        }
        async fn set(&self, key: &str, value: &[u8], _: Option<Duration>) -> Result<(), CacheError> {
            self.values.lock().insert(key.to_string(), value.to_vec());
            Ok(())
        }
        async fn set_if_absent(
            &self,
            key: &str,
            value: &[u8],
            _: Option<Duration>,
        ) -> Result<bool, CacheError> {
            let mut values = self.values.lock();
            if values.contains_key(key) {
                Ok(false)
            } else {
                values.insert(key.to_string(), value.to_vec());
                Ok(true)
            }
        }
        async fn del(&self, key: &str) -> Result<bool, CacheError> {
            Ok(self.values.lock().remove(key).is_some())
        }
        async fn del_many(&self, _: &[String]) -> Result<u64, CacheError> {
            Ok(0)
        }
        async fn hset(&self, _: &str, _: &str, _: &str) -> Result<(), CacheError> {
            Ok(())
        }
        async fn hget(&self, _: &str, _: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, CacheError> {
            Ok(true)
        }
        async fn pttl(&self, _: &str) -> Result<i64, CacheError> {
            Ok(-1)
        }
        async fn keys(&self, _: &str) -> Result<Vec<String>, CacheError> {
            Ok(vec![])
        }
        async fn scan(&self, _: &str) -> Result<Vec<String>, CacheError> {
            Ok(vec![])
        }
        async fn eval(
            &self,
            script: &str,
            keys: &[String],
            args: &[String],
        ) -> Result<i64, CacheError> {
            let key = keys.first().cloned().unwrap_or_default();
            let token = args.first().cloned().unwrap_or_default();
            let mut values = self.values.lock();
            let matches = values
                .get(&key)
                .is_some_and(|v| v.as_slice() == token.as_bytes());
            if !matches {
                return Ok(0);
            }
            if script.contains("del") {
                values.remove(&key);
            }
            Ok(1) // matched: extended or deleted
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn only_one_actor_wins() {
        let redis = Arc::new(LockStub::default());
        let a = RedisLeaseLock::new(redis.clone());
        let b = RedisLeaseLock::new(redis.clone());

        assert!(a
            .try_lock("users:7", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!b
            .try_lock("users:7", Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap());

        a.unlock("users:7").await.unwrap();
        assert!(b
            .try_lock("users:7", Duration::from_millis(100), Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reentrant_within_the_same_actor() {
        let lock = RedisLeaseLock::new(Arc::new(LockStub::default()));
        assert!(lock
            .try_lock("job", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap());
        assert!(lock
            .try_lock("job", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap());

        // First unlock only decrements; the key stays held.
        lock.unlock("job").await.unwrap();
        let other = RedisLeaseLock::new(lock.redis.clone());
        assert!(!other
            .try_lock("job", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap());

        lock.unlock("job").await.unwrap();
        assert!(other
            .try_lock("job", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unlock_without_hold_is_a_noop() {
        let redis = Arc::new(LockStub::default());
        let holder = RedisLeaseLock::new(redis.clone());
        let stranger = RedisLeaseLock::new(redis.clone());

        holder
            .try_lock("shared", Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();
        stranger.unlock("shared").await.unwrap();

        // The holder's key must still be there.
        assert!(redis.get("lock:shared").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let redis = Arc::new(LockStub::default());
        let lock = RedisLeaseLock::new(redis.clone());

        let result: Result<(), CacheError> =
            with_lock(&lock, "job", Duration::from_secs(5), || async {
                Err(CacheError::Transient("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(redis.get("lock:job").await.unwrap().is_none());
    }
}
