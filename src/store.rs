//! Cache store: the get/set/mget/invalidate primitive
//!
//! Composes a [`KvBackend`], the [`Codec`] and a [`CircuitBreaker`]. Every
//! backend call is guarded by the breaker, and any backend error degrades to
//! the fail-open result (`None`, `false`, empty) after being counted. Callers
//! never see backend exceptions from this layer.

use std::{
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    BackgroundTasks, BoxError, CacheConfig, CacheEntry, CacheError, CircuitBreaker,
    CircuitBreakerState, CircuitState, Codec, InvalidationBus, InvalidationEvent, KvBackend,
    backend::glob_regex,
};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Caller-supplied function producing a fresh value for a key
pub type Refresher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>;

/// Wrap an async closure as a [`Refresher`]
pub fn refresher<T, F, Fut>(f: F) -> Refresher<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Escape glob metacharacters so a literal key can be used as a pattern
pub fn escape_glob(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct StoreInner {
    name: String,
    backend: Arc<dyn KvBackend>,
    codec: Codec,
    breaker: CircuitBreaker,
    tasks: BackgroundTasks,
    bus: Option<InvalidationBus>,
    origin: Option<String>,
    soft_ttl_ratio: f64,
    background_refresh_fraction: f64,
    /// Live refresh timer per key, tagged with the generation that armed it
    refresh_timers: DashMap<String, (u64, AbortHandle)>,
    timer_generation: AtomicU64,
    refreshing: DashSet<String>,
    local_level: OnceLock<CacheStore>,
}

/// Breaker-guarded cache over one backend. Cloning shares the store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

/// Held while a background refresh for a key is in flight
pub struct RefreshGuard {
    store: CacheStore,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.store.inner.refreshing.remove(&self.key);
    }
}

impl CacheStore {
    /// Store that does not publish invalidations
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn KvBackend>,
        config: &CacheConfig,
        tasks: BackgroundTasks,
    ) -> Self {
        Self::build(name.into(), backend, config, tasks, None)
    }

    /// Store that publishes an [`InvalidationEvent`] tagged with `origin` on every invalidation
    pub fn with_invalidation(
        name: impl Into<String>,
        backend: Arc<dyn KvBackend>,
        config: &CacheConfig,
        tasks: BackgroundTasks,
        bus: InvalidationBus,
        origin: impl Into<String>,
    ) -> Self {
        Self::build(
            name.into(),
            backend,
            config,
            tasks,
            Some((bus, origin.into())),
        )
    }

    fn build(
        name: String,
        backend: Arc<dyn KvBackend>,
        config: &CacheConfig,
        tasks: BackgroundTasks,
        bus: Option<(InvalidationBus, String)>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            format!("cache:{name}"),
            config.circuit_threshold,
            config.circuit_cooldown,
        );
        let (bus, origin) = match bus {
            Some((bus, origin)) => (Some(bus), Some(origin)),
            None => (None, None),
        };
        Self {
            inner: Arc::new(StoreInner {
                name,
                backend,
                codec: Codec::new(config.compression_threshold, config.max_entry_size),
                breaker,
                tasks,
                bus,
                origin,
                soft_ttl_ratio: config.soft_ttl_ratio,
                background_refresh_fraction: config.background_refresh_fraction,
                refresh_timers: DashMap::new(),
                timer_generation: AtomicU64::new(0),
                refreshing: DashSet::new(),
                local_level: OnceLock::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Invalidations on this store also evict matching keys from `local`.
    /// Only the first call takes effect.
    pub fn cascade_to(&self, local: CacheStore) {
        if self.inner.local_level.set(local).is_err() {
            debug!(store = %self.inner.name, "Local level already attached");
        }
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn circuit_snapshot(&self) -> CircuitBreakerState {
        self.inner.breaker.snapshot()
    }

    /// Round-trip to the backend through the breaker
    pub async fn ping(&self) -> bool {
        self.guarded("ping", "", self.inner.backend.ping())
            .await
            .is_some()
    }

    /// Run a backend call through the breaker, degrading any failure to `None`
    async fn guarded<R, F>(&self, op: &'static str, target: &str, call: F) -> Option<R>
    where
        F: Future<Output = Result<R, CacheError>>,
    {
        if !self.inner.breaker.should_allow() {
            debug!(store = %self.inner.name, op = op, key = target, "Cache circuit open, skipping");
            return None;
        }
        match call.await {
            Ok(v) => Some(v),
            Err(e) => {
                // Malformed requests say nothing about backend health
                if !matches!(e, CacheError::InvalidRequest(_)) {
                    self.inner.breaker.record_failure();
                }
                warn!(
                    store = %self.inner.name,
                    backend = self.inner.backend.name(),
                    op = op,
                    key = target,
                    error = %e,
                    "Cache backend call failed, failing open"
                );
                None
            }
        }
    }

    fn decode_entry<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Option<CacheEntry<T>> {
        match self.inner.codec.decode::<CacheEntry<T>>(bytes) {
            Ok(mut entry) => {
                entry.compressed = Codec::is_compressed(bytes);
                Some(entry)
            }
            Err(e) => {
                warn!(store = %self.inner.name, key = key, error = %e, "Failed to decode cached entry");
                None
            }
        }
    }

    /// Full entry for `key`, including timestamps. `None` on miss, decode failure or open circuit.
    pub async fn get_entry<T: Cacheable>(&self, key: &str) -> Option<CacheEntry<T>> {
        let bytes = self
            .guarded("get", key, self.inner.backend.get(key))
            .await
            .flatten()?;

        match self.decode_entry(key, &bytes) {
            Some(entry) => Some(entry),
            None => {
                // Drop the corrupt entry so the next read repopulates it
                self.guarded("del", key, self.inner.backend.del(&[key.to_owned()]))
                    .await;
                None
            }
        }
    }

    pub async fn get<T: Cacheable>(&self, key: &str) -> Option<T> {
        let value = self.get_entry::<T>(key).await.map(|e| e.data);
        debug!(store = %self.inner.name, key = key, hit = value.is_some(), "Cache get");
        value
    }

    /// Like [`CacheStore::get`], but a soft-expired entry is still returned while
    /// `refresh` recomputes it in the background and re-caches it for `ttl`.
    pub async fn get_or_revalidate<T: Cacheable>(
        &self,
        key: &str,
        ttl: Duration,
        refresh: Refresher<T>,
    ) -> Option<T> {
        let entry = self.get_entry::<T>(key).await?;
        if entry.is_stale() {
            debug!(store = %self.inner.name, key = key, "Serving stale entry while revalidating");
            self.spawn_refresh(key, ttl, refresh);
        }
        Some(entry.data)
    }

    /// Mark `key` as refreshing; `None` if a refresh is already in flight
    pub fn try_begin_refresh(&self, key: &str) -> Option<RefreshGuard> {
        self.inner
            .refreshing
            .insert(key.to_owned())
            .then(|| RefreshGuard {
                store: self.clone(),
                key: key.to_owned(),
            })
    }

    /// Recompute `key` once in the background and re-cache it
    pub fn spawn_refresh<T: Cacheable>(&self, key: &str, ttl: Duration, refresh: Refresher<T>) {
        let Some(guard) = self.try_begin_refresh(key) else {
            debug!(store = %self.inner.name, key = key, "Refresh already in flight");
            return;
        };
        let store = self.clone();
        let owned_key = key.to_owned();
        self.inner.tasks.submit("stale_refresh", key, async move {
            let _guard = guard;
            let value = refresh().await?;
            store.set(&owned_key, &value, ttl).await;
            Ok(())
        });
    }

    /// Batched read. One slot per key, in input order; misses and undecodable entries are `None`.
    pub async fn mget<T: Cacheable>(&self, keys: &[String]) -> Vec<Option<T>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let target = keys.first().map(String::as_str).unwrap_or_default();
        let Some(raw) = self.guarded("mget", target, self.inner.backend.mget(keys)).await else {
            return vec![None; keys.len()];
        };
        if raw.len() != keys.len() {
            warn!(
                store = %self.inner.name,
                requested = keys.len(),
                returned = raw.len(),
                "Backend returned mismatched batch, treating as misses"
            );
            return vec![None; keys.len()];
        }

        keys.iter()
            .zip(raw)
            .map(|(key, bytes)| {
                bytes
                    .and_then(|b| self.decode_entry::<T>(key, &b))
                    .map(|e| e.data)
            })
            .collect()
    }

    /// Encode and write `value` with a hard backend TTL of `ttl`.
    ///
    /// Returns `false` without erroring when the entry is too large, cannot be
    /// encoded, the circuit is open or the backend call fails.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let entry = CacheEntry::new(value, ttl, self.inner.soft_ttl_ratio);
        let bytes = match self.inner.codec.encode(&entry) {
            Ok(bytes) => bytes,
            Err(CacheError::EntryTooLarge { size, max }) => {
                warn!(
                    store = %self.inner.name,
                    key = key,
                    size,
                    max,
                    "Entry exceeds max size, not caching"
                );
                return false;
            }
            Err(e) => {
                warn!(store = %self.inner.name, key = key, error = %e, "Failed to encode entry, not caching");
                return false;
            }
        };

        self.guarded("set", key, self.inner.backend.set_ex(key, bytes, ttl))
            .await
            .is_some()
    }

    /// [`CacheStore::set`], then keep the key warm: every `ttl * background_refresh_fraction`
    /// `refresh` recomputes the value and re-caches it. A newer call for the same key
    /// replaces the timer; invalidation or a failed refresh stops it.
    pub async fn set_with_refresh<T: Cacheable>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
        refresh: Refresher<T>,
    ) -> bool {
        let written = self.set(key, value, ttl).await;
        if written {
            self.schedule_refresh(key, ttl, refresh);
        }
        written
    }

    fn schedule_refresh<T: Cacheable>(&self, key: &str, ttl: Duration, refresh: Refresher<T>) {
        let delay = ttl.mul_f64(self.inner.background_refresh_fraction);
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed);
        let store = self.clone();
        let owned_key = key.to_owned();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let job =
                background_refresh_job(store.clone(), owned_key.clone(), generation, ttl, refresh);
            if !store
                .inner
                .tasks
                .submit("background_refresh", owned_key.clone(), job)
            {
                store.retire_refresh_timer(&owned_key, generation);
            }
        });

        if let Some((_, previous)) = self
            .inner
            .refresh_timers
            .insert(key.to_owned(), (generation, timer.abort_handle()))
        {
            previous.abort();
        }
    }

    /// Forget the timer armed as `generation` unless a newer one replaced it
    fn retire_refresh_timer(&self, key: &str, generation: u64) {
        self.inner
            .refresh_timers
            .remove_if(key, |_, (armed, _)| *armed == generation);
    }

    fn cancel_refresh_timers(&self, keys: &[String]) {
        for key in keys {
            if let Some((_, (_, timer))) = self.inner.refresh_timers.remove(key) {
                timer.abort();
            }
        }
    }

    fn valid_pattern(&self, pattern: &str) -> bool {
        match glob_regex(pattern) {
            Ok(_) => true,
            Err(e) => {
                warn!(store = %self.inner.name, pattern = pattern, error = %e, "Rejecting key pattern");
                false
            }
        }
    }

    /// Delete one key without publishing. `true` when it existed.
    pub async fn evict_key(&self, key: &str) -> bool {
        let keys = [key.to_owned()];
        self.cancel_refresh_timers(&keys);
        self.guarded("del", key, self.inner.backend.del(&keys))
            .await
            .is_some_and(|n| n > 0)
    }

    /// Number of keys with a live background refresh timer
    pub fn refresh_timer_count(&self) -> usize {
        self.inner.refresh_timers.len()
    }

    /// Delete every key matching `pattern` without publishing. Returns the number deleted.
    pub async fn evict_matching(&self, pattern: &str) -> u64 {
        if !self.valid_pattern(pattern) {
            return 0;
        }
        let Some(keys) = self
            .guarded("keys", pattern, self.inner.backend.keys(pattern))
            .await
        else {
            return 0;
        };
        self.cancel_refresh_timers(&keys);
        if keys.is_empty() {
            return 0;
        }
        self.guarded("del", pattern, self.inner.backend.del(&keys))
            .await
            .unwrap_or(0)
    }

    /// Delete every key matching `pattern` and broadcast an [`InvalidationEvent`].
    ///
    /// An attached local level (see [`CacheStore::cascade_to`]) is evicted first.
    /// Zero matches is a success. Returns `false` when the pattern is malformed
    /// or the backend could not be reached.
    pub async fn invalidate(&self, pattern: &str, reason: &str) -> bool {
        if !self.valid_pattern(pattern) {
            return false;
        }
        if let Some(local) = self.inner.local_level.get() {
            local.evict_matching(pattern).await;
        }
        let Some(keys) = self
            .guarded("keys", pattern, self.inner.backend.keys(pattern))
            .await
        else {
            return false;
        };
        self.cancel_refresh_timers(&keys);

        let deleted = if keys.is_empty() {
            0
        } else {
            match self
                .guarded("del", pattern, self.inner.backend.del(&keys))
                .await
            {
                Some(n) => n,
                None => return false,
            }
        };
        info!(
            store = %self.inner.name,
            pattern = pattern,
            reason = reason,
            deleted,
            "Cache invalidated"
        );

        self.publish(pattern, reason).await;
        true
    }

    /// Invalidate exactly one key, escaping any glob characters in it
    pub async fn invalidate_key(&self, key: &str, reason: &str) -> bool {
        self.invalidate(&escape_glob(key), reason).await
    }

    async fn publish(&self, pattern: &str, reason: &str) {
        let Some(bus) = &self.inner.bus else {
            return;
        };
        let mut event = InvalidationEvent::new(pattern, reason);
        event.origin = self.inner.origin.clone();
        if let Err(e) = bus.publish(&event).await {
            warn!(
                channel = bus.channel(),
                pattern = pattern,
                error = %e,
                "Invalidation publish failed, peers keep local copies until expiry"
            );
        }
    }
}

fn background_refresh_job<T: Cacheable>(
    store: CacheStore,
    key: String,
    generation: u64,
    ttl: Duration,
    refresh: Refresher<T>,
) -> BoxFuture<'static, Result<(), BoxError>> {
    Box::pin(async move {
        let value = match refresh().await {
            Ok(value) => value,
            Err(e) => {
                store.retire_refresh_timer(&key, generation);
                return Err(e);
            }
        };
        // Re-arming replaces this generation's entry
        if store
            .set_with_refresh(&key, &value, ttl, Arc::clone(&refresh))
            .await
        {
            Ok(())
        } else {
            store.retire_refresh_timer(&key, generation);
            Err(format!("background refresh of {key} was not cached, stopping").into())
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{LocalPubSub, MemoryBackend};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Course {
        pub id: u32,
        pub title: String,
    }

    pub fn course(id: u32) -> Course {
        Course {
            id,
            title: format!("Course {id}"),
        }
    }

    /// Memory backend that can be switched into failing every call
    #[derive(Clone, Default)]
    pub struct FlakyBackend {
        pub inner: MemoryBackend,
        pub failing: Arc<AtomicBool>,
        pub calls: Arc<AtomicU32>,
    }

    impl FlakyBackend {
        fn check(&self) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(CacheError::Timeout("simulated outage".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
            self.check()?;
            self.inner.set_ex(key, value, ttl).await
        }

        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
            self.check()?;
            self.inner.mget(keys).await
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
            self.check()?;
            self.inner.keys(pattern).await
        }

        async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
            self.check()?;
            self.inner.del(keys).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    pub fn store_over(backend: Arc<dyn KvBackend>, config: &CacheConfig) -> CacheStore {
        CacheStore::new(
            "test",
            backend,
            config,
            BackgroundTasks::new(config.task_queue_capacity),
        )
    }

    fn memory_store(config: &CacheConfig) -> (CacheStore, MemoryBackend) {
        let backend = MemoryBackend::default();
        (store_over(Arc::new(backend.clone()), config), backend)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (store, _) = memory_store(&CacheConfig::default());
        assert!(store.set("course:1", &course(1), Duration::from_secs(60)).await);
        assert_eq!(store.get::<Course>("course:1").await, Some(course(1)));
        assert_eq!(store.get::<Course>("course:2").await, None);
    }

    #[tokio::test]
    async fn oversized_values_are_not_cached() {
        let config = CacheConfig {
            compression_threshold: usize::MAX,
            max_entry_size: 256,
            ..Default::default()
        };
        let (store, _) = memory_store(&config);
        let big = "x".repeat(1_000);
        assert!(!store.set("big", &big, Duration::from_secs(60)).await);
        assert_eq!(store.get::<String>("big").await, None);
    }

    #[tokio::test]
    async fn large_values_are_stored_compressed() {
        let config = CacheConfig {
            compression_threshold: 1024,
            ..Default::default()
        };
        let (store, backend) = memory_store(&config);
        let body = "module ".repeat(2_000);
        assert!(store.set("content:1", &body, Duration::from_secs(60)).await);

        let raw = backend.raw("content:1").await.unwrap();
        assert!(Codec::is_compressed(&raw));

        let entry = store.get_entry::<String>("content:1").await.unwrap();
        assert!(entry.compressed);
        assert_eq!(entry.data, body);
    }

    #[tokio::test]
    async fn mget_preserves_order_with_gaps() {
        let (store, _) = memory_store(&CacheConfig::default());
        store.set("k2", &course(2), Duration::from_secs(60)).await;

        let keys = vec!["k1".to_owned(), "k2".to_owned(), "k3".to_owned()];
        let got = store.mget::<Course>(&keys).await;
        assert_eq!(got, vec![None, Some(course(2)), None]);
    }

    #[tokio::test]
    async fn corrupt_entries_read_as_miss_and_are_removed() {
        let (store, backend) = memory_store(&CacheConfig::default());
        backend
            .set_ex("bad", b"{not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get::<Course>("bad").await, None);
        assert!(backend.raw("bad").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_open_until_cooldown() {
        let config = CacheConfig {
            circuit_threshold: 3,
            circuit_cooldown: Duration::from_secs(60),
            ..Default::default()
        };
        let backend = FlakyBackend::default();
        let store = store_over(Arc::new(backend.clone()), &config);
        assert!(store.set("k", &1u32, Duration::from_secs(600)).await);

        backend.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert_eq!(store.get::<u32>("k").await, None);
        }
        assert_eq!(store.circuit_state(), CircuitState::Open);

        // Short-circuited: no further backend calls, fail-open results
        let calls = backend.calls.load(Ordering::SeqCst);
        backend.failing.store(false, Ordering::SeqCst);
        assert_eq!(store.get::<u32>("k").await, None);
        assert!(!store.set("k", &2u32, Duration::from_secs(600)).await);
        assert!(!store.invalidate("k", "test").await);
        assert_eq!(store.mget::<u32>(&["k".to_owned()]).await, vec![None]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get::<u32>("k").await, Some(1));
        assert_eq!(store.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn invalidate_removes_matches_and_publishes() {
        let transport = LocalPubSub::new();
        let bus = InvalidationBus::new(Arc::new(transport), "cache:invalidation");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(move |event| {
            let _ = tx.send(event);
        });

        let config = CacheConfig::default();
        let backend = MemoryBackend::default();
        let store = CacheStore::with_invalidation(
            "shared",
            Arc::new(backend.clone()),
            &config,
            BackgroundTasks::new(16),
            bus,
            "instance-a",
        );
        for id in 1..=3 {
            store.set(&format!("course:{id}"), &course(id), Duration::from_secs(60)).await;
        }
        store.set("user:1", &"ada", Duration::from_secs(60)).await;

        assert!(store.invalidate("course:*", "manual").await);
        assert!(backend.keys("course:*").await.unwrap().is_empty());
        assert_eq!(store.get::<String>("user:1").await.as_deref(), Some("ada"));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.pattern, "course:*");
        assert_eq!(event.reason, "manual");
        assert_eq!(event.origin.as_deref(), Some("instance-a"));

        // No matches is still a success
        assert!(store.invalidate("missing:*", "manual").await);
    }

    #[tokio::test]
    async fn invalidate_key_treats_glob_characters_literally() {
        let (store, _) = memory_store(&CacheConfig::default());
        store.set("search:a*", &1u32, Duration::from_secs(60)).await;
        store.set("search:abc", &2u32, Duration::from_secs(60)).await;

        assert!(store.invalidate_key("search:a*", "test").await);
        assert_eq!(store.get::<u32>("search:a*").await, None);
        assert_eq!(store.get::<u32>("search:abc").await, Some(2));
    }

    #[tokio::test]
    async fn evict_key_removes_exactly_that_key() {
        let (store, _) = memory_store(&CacheConfig::default());
        store.set("search:a*", &1u32, Duration::from_secs(60)).await;
        store.set("search:abc", &2u32, Duration::from_secs(60)).await;

        assert!(store.evict_key("search:a*").await);
        assert!(!store.evict_key("search:a*").await);
        assert_eq!(store.get::<u32>("search:abc").await, Some(2));
    }

    #[tokio::test]
    async fn malformed_patterns_are_rejected_without_counting_failures() {
        let config = CacheConfig {
            circuit_threshold: 2,
            ..Default::default()
        };
        let backend = FlakyBackend::default();
        let store = store_over(Arc::new(backend.clone()), &config);
        for _ in 0..5 {
            assert!(!store.invalidate("course:[z-a]", "manual").await);
        }
        assert_eq!(store.circuit_state(), CircuitState::Closed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entries_are_served_while_revalidating() {
        let config = CacheConfig {
            soft_ttl_ratio: 0.05,
            ..Default::default()
        };
        let (store, _) = memory_store(&config);
        let ttl = Duration::from_secs(2);
        store.set("course:1", &course(1), ttl).await;

        // Soft expiry is 100ms, hard TTL is 2s
        tokio::time::sleep(Duration::from_millis(150)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let refresh = refresher(move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Course {
                    id: 1,
                    title: "Refreshed".to_owned(),
                })
            }
        });

        let served = store.get_or_revalidate("course:1", ttl, refresh).await;
        assert_eq!(served, Some(course(1)));

        store.tasks().drain().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get::<Course>("course:1").await.map(|c| c.title),
            Some("Refreshed".to_owned())
        );
    }

    #[tokio::test]
    async fn failed_revalidation_is_logged_not_thrown() {
        let config = CacheConfig {
            soft_ttl_ratio: 0.05,
            ..Default::default()
        };
        let (store, _) = memory_store(&config);
        let ttl = Duration::from_secs(2);
        store.set("k", &1u32, ttl).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let refresh = refresher(|| async { Err::<u32, BoxError>("source down".into()) });
        assert_eq!(store.get_or_revalidate("k", ttl, refresh).await, Some(1));

        store.tasks().drain().await;
        assert_eq!(store.tasks().stats().failed, 1);
        assert_eq!(store.get::<u32>("k").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_recurs_until_invalidated() {
        let (store, _) = memory_store(&CacheConfig::default());
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let refresh = refresher(move || {
            let c = Arc::clone(&c);
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) + 100) }
        });

        let ttl = Duration::from_secs(40);
        assert!(store.set_with_refresh("stats", &0u32, ttl, refresh).await);
        assert_eq!(store.refresh_timer_count(), 1);

        // First refresh fires at 30s (0.75 * 40s)
        tokio::time::sleep(Duration::from_secs(31)).await;
        store.tasks().drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(store.refresh_timer_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        store.tasks().drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(store.invalidate("stats", "manual").await);
        assert_eq!(store.refresh_timer_count(), 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        store.tasks().drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_background_refresh_releases_its_timer() {
        let (store, _) = memory_store(&CacheConfig::default());
        let refresh = refresher(|| async { Err::<u32, BoxError>("source down".into()) });

        let ttl = Duration::from_secs(40);
        assert!(store.set_with_refresh("stats", &0u32, ttl, refresh).await);
        assert_eq!(store.refresh_timer_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        store.tasks().drain().await;
        assert_eq!(store.tasks().stats().failed, 1);
        assert_eq!(store.refresh_timer_count(), 0);
    }
}
