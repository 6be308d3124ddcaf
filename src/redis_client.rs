//! Redis client backed by `ConnectionManager`
//!
//! Production implementation of the [`RedisClient`] contract with automatic
//! reconnection. Each operation clones the manager handle, which is the
//! cheap, multiplexed way to share one connection across tasks.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::traits::RedisClient;

/// `ConnectionManager`-backed Redis client
pub struct ConnectionManagerClient {
    conn_manager: ConnectionManager,
}

impl ConnectionManagerClient {
    /// Connect using the `REDIS_URL` environment variable
    /// (default `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns an error when the client cannot be created or the initial
    /// PING fails.
    pub async fn new() -> Result<Self, CacheError> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        Self::with_url(&redis_url).await
    }

    /// Connect to a specific Redis URL.
    ///
    /// # Errors
    ///
    /// Returns an error when the client cannot be created or the initial
    /// PING fails.
    pub async fn with_url(redis_url: &str) -> Result<Self, CacheError> {
        info!(redis_url = %redis_url, "Initializing Redis client with ConnectionManager");

        let client = Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await?;

        // Fail fast if the server is unreachable.
        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(redis_url = %redis_url, "Redis client connected (ConnectionManager enabled)");
        Ok(Self { conn_manager })
    }
}

#[async_trait]
impl RedisClient for ConnectionManagerClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        match ttl {
            Some(ttl) if !ttl.is_zero() => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            _ => {
                let _: () = conn.set(key, value).await?;
            }
        }
        debug!(key = %key, ttl = ?ttl, "[redis] SET");
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX")
                .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn_manager.clone();
        let removed: u64 = conn.del(keys).await?;
        debug!(count = removed, "[redis] bulk DEL");
        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn_manager.clone();
        let set: bool = conn
            .expire(key, i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
            .await?;
        Ok(set)
    }

    async fn pttl(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn_manager.clone();
        let remaining: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(remaining)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let result: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            cursor = result.0;
            keys.extend(result.1);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[redis] scanned keys matching pattern");
        Ok(keys)
    }

    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, CacheError> {
        let mut conn = self.conn_manager.clone();
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }
        let reply: i64 = cmd.query_async(&mut conn).await?;
        Ok(reply)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
