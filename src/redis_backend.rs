//! Redis implementation of [`KvBackend`]

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, RedisResult, aio::ConnectionManager};
use tracing::debug;

use crate::{CacheError, KvBackend};

/// Keys requested per SCAN round-trip
const SCAN_COUNT: usize = 500;

/// Shared backend over a multiplexed, auto-reconnecting Redis connection.
///
/// Every command is bounded by `timeout`; an elapsed timeout surfaces as
/// [`CacheError::Timeout`] and counts as a breaker failure like any other error.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        Self::new(client, timeout).await
    }

    pub async fn new(client: redis::Client, timeout: Duration) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, timeout })
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout(format!(
                "{op} after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        self.timed("GET", conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        // Redis TTLs are whole seconds; never round a live entry down to zero
        let seconds = ttl.as_secs().max(1);
        self.timed("SETEX", conn.set_ex::<_, _, ()>(key, value, seconds))
            .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        self.timed(
            "MGET",
            redis::cmd("MGET")
                .arg(keys)
                .query_async::<Vec<Option<Vec<u8>>>>(&mut conn),
        )
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let scan = async {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok::<_, redis::RedisError>(keys)
        };

        let mut keys = self.timed("SCAN", scan).await?;
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        debug!(pattern = pattern, matched = keys.len(), "Resolved key pattern");
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.timed("DEL", conn.del::<_, u64>(keys)).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        self.timed("PING", redis::cmd("PING").query_async::<String>(&mut conn))
            .await
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
