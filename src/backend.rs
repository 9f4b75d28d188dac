//! Key-value backend abstraction
//!
//! The store talks to any backend that can get, set with TTL, batch-get,
//! resolve glob patterns and delete. [`crate::RedisBackend`] is the shared,
//! networked implementation; [`MemoryBackend`] is process-local and doubles as
//! the first level of hierarchical lookups.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use regex::Regex;

use crate::CacheError;

/// Storage primitives the cache store needs from a backend. TTLs are hard:
/// the backend removes the entry once they elapse.
#[async_trait]
pub trait KvBackend: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Batched read, one slot per requested key in the same order
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    /// Resolve a glob pattern (`*`, `?`, `[...]`) to the keys currently stored
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[derive(Clone)]
struct StoredValue {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with
struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process backend on top of a Moka cache with per-entry TTLs
#[derive(Clone)]
pub struct MemoryBackend {
    cache: Cache<String, StoredValue>,
}

impl MemoryBackend {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Number of live entries, after running pending maintenance
    pub async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Raw bytes stored under `key`, bypassing the codec
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await.map(|v| v.bytes.as_ref().clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.cache.get(key).await.map(|v| v.bytes.as_ref().clone()))
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.cache
            .insert(
                key.to_owned(),
                StoredValue {
                    bytes: Arc::new(value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.cache.get(key).await.map(|v| v.bytes.as_ref().clone()));
        }
        Ok(out)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let re = glob_regex(pattern)?;
        Ok(self
            .cache
            .iter()
            .filter(|(k, _)| re.is_match(k))
            .map(|(k, _)| k.as_ref().clone())
            .collect())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut removed = 0;
        for key in keys {
            if self.cache.remove(key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Translate a Redis-style glob into an anchored regex
pub(crate) fn glob_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    re.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        re.push('\\');
                    }
                    re.push(inner);
                }
                re.push(']');
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re)
        .map_err(|e| CacheError::InvalidRequest(format!("malformed key pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_like_redis() {
        let re = glob_regex("course:*").unwrap();
        assert!(re.is_match("course:42"));
        assert!(re.is_match("course:"));
        assert!(!re.is_match("courses:42"));
        assert!(!re.is_match("user:course:1"));

        let re = glob_regex("user:?").unwrap();
        assert!(re.is_match("user:1"));
        assert!(!re.is_match("user:12"));

        let re = glob_regex("h[ae]llo.*").unwrap();
        assert!(re.is_match("hello.x"));
        assert!(re.is_match("hallo.y"));
        assert!(!re.is_match("hillo.z"));
        // '.' is literal
        assert!(!re.is_match("helloxx"));
    }

    #[test]
    fn malformed_globs_are_caller_errors() {
        let err = glob_regex("course:[z-a]").unwrap_err();
        assert!(matches!(err, CacheError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn memory_backend_basic_ops() {
        let backend = MemoryBackend::default();
        backend
            .set_ex("course:1", b"a".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set_ex("course:2", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        backend
            .set_ex("user:1", b"c".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(backend.get("course:1").await.unwrap(), Some(b"a".to_vec()));
        let got = backend
            .mget(&["user:1".to_owned(), "nope".to_owned(), "course:2".to_owned()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some(b"c".to_vec()), None, Some(b"b".to_vec())]);

        let mut keys = backend.keys("course:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["course:1", "course:2"]);

        assert_eq!(backend.del(&keys).await.unwrap(), 2);
        assert!(backend.keys("course:*").await.unwrap().is_empty());
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn memory_backend_honours_ttl() {
        let backend = MemoryBackend::default();
        backend
            .set_ex("k", b"v".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(backend.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(backend.get("k").await.unwrap().is_none());
    }
}
