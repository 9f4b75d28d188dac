//! Engine facade
//!
//! [`CacheEngine`] is the explicitly constructed entry point services hold on
//! to. It owns the shared store, a process-local level, the background task
//! runner, the invalidation bus and the strategy table. Clones share all of it.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    BackgroundTasks, CacheConfig, CacheError, CacheStore, CircuitState, InvalidationBus,
    InvalidationEvent, InvalidationTransport, KvBackend, MemoryBackend, RedisBackend, RedisPubSub,
    patterns::{Pattern, ResourceStrategyBinding},
    store::Cacheable,
    strategy::{ExecuteRequest, Outcome, ResourceStats, StrategyManager},
    tasks::TaskStats,
};

struct EngineInner {
    instance_id: String,
    config: CacheConfig,
    shared: CacheStore,
    local: CacheStore,
    tasks: BackgroundTasks,
    strategies: StrategyManager,
    pubsub: Option<Arc<RedisPubSub>>,
}

/// Adaptive caching engine. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl CacheEngine {
    /// Connect to Redis for storage and, when `enable_pubsub` is set, for invalidation fan-out
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let client = redis::Client::open(config.redis_url.as_str())?;
        let backend = RedisBackend::new(client.clone(), config.backend_timeout).await?;

        let pubsub = if config.enable_pubsub {
            Some(Arc::new(RedisPubSub::new(client).await?))
        } else {
            None
        };
        let transport = pubsub
            .clone()
            .map(|p| p as Arc<dyn InvalidationTransport>);

        let engine = Self::build(config, Arc::new(backend), transport, pubsub)?;
        info!(
            instance = %engine.instance_id(),
            redis_url = %engine.inner.config.redis_url,
            "Cache engine connected"
        );
        Ok(engine)
    }

    /// Engine over an injected backend and optional transport. Must be called inside a tokio runtime.
    pub fn new(
        config: CacheConfig,
        backend: Arc<dyn KvBackend>,
        transport: Option<Arc<dyn InvalidationTransport>>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        Self::build(config, backend, transport, None)
    }

    fn build(
        config: CacheConfig,
        backend: Arc<dyn KvBackend>,
        transport: Option<Arc<dyn InvalidationTransport>>,
        pubsub: Option<Arc<RedisPubSub>>,
    ) -> Result<Self, CacheError> {
        let instance_id = Uuid::new_v4().to_string();
        let tasks = BackgroundTasks::new(config.task_queue_capacity);
        let local = CacheStore::new(
            "local",
            Arc::new(MemoryBackend::new(config.l1_max_capacity)),
            &config,
            tasks.clone(),
        );

        let shared = match transport {
            Some(transport) => {
                let bus = InvalidationBus::new(transport, config.invalidation_channel.clone());
                subscribe_local_eviction(&bus, &local, &tasks, &instance_id);
                CacheStore::with_invalidation(
                    "shared",
                    backend,
                    &config,
                    tasks.clone(),
                    bus,
                    instance_id.clone(),
                )
            }
            None => CacheStore::new("shared", backend, &config, tasks.clone()),
        };
        shared.cascade_to(local.clone());

        let strategies = StrategyManager::new(&config, shared.clone(), local.clone());
        Ok(Self {
            inner: Arc::new(EngineInner {
                instance_id,
                config,
                shared,
                local,
                tasks,
                strategies,
                pubsub,
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Shared store, for callers using the plain get/set/invalidate contract
    pub fn store(&self) -> &CacheStore {
        &self.inner.shared
    }

    /// Process-local level used by hierarchical reads
    pub fn local(&self) -> &CacheStore {
        &self.inner.local
    }

    pub fn strategies(&self) -> &StrategyManager {
        &self.inner.strategies
    }

    pub async fn execute<T: Cacheable>(
        &self,
        request: ExecuteRequest<T>,
    ) -> Result<Outcome<T>, CacheError> {
        self.inner.strategies.execute(request).await
    }

    pub async fn batch_execute<T: Cacheable>(
        &self,
        requests: Vec<ExecuteRequest<T>>,
    ) -> Vec<Result<Outcome<T>, CacheError>> {
        self.inner.strategies.batch_execute(requests).await
    }

    /// Evict `pattern` from this process, delete it from the shared store and
    /// tell every peer. `false` when the pattern is malformed or the shared
    /// backend was unreachable.
    pub async fn invalidate(&self, pattern: &str, reason: &str) -> bool {
        self.inner.shared.invalidate(pattern, reason).await
    }

    pub fn update_resource_strategy(
        &self,
        resource: &str,
        read_pattern: Pattern,
        write_pattern: Pattern,
    ) -> Result<(), CacheError> {
        self.inner
            .strategies
            .update_resource_strategy(resource, read_pattern, write_pattern)
    }

    pub fn optimize_strategy(&self, resource: &str) -> Option<ResourceStrategyBinding> {
        self.inner.strategies.optimize_strategy(resource)
    }

    pub fn resource_stats(&self, resource: &str) -> ResourceStats {
        self.inner.strategies.resource_stats(resource)
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            instance_id: self.inner.instance_id.clone(),
            circuit: self.inner.shared.circuit_state(),
            tasks: self.inner.tasks.stats(),
            bindings: self.inner.strategies.bindings(),
        }
    }

    /// Whether the shared backend answers; `false` while the circuit is open
    pub async fn ping(&self) -> bool {
        self.inner.shared.ping().await
    }

    /// Wait for every queued background job to finish
    pub async fn drain(&self) {
        self.inner.tasks.drain().await;
    }

    /// Drain background work and stop the pub/sub listener
    pub async fn shutdown(&self) {
        self.drain().await;
        if let Some(pubsub) = &self.inner.pubsub {
            pubsub.shutdown();
        }
        info!(instance = %self.inner.instance_id, "Cache engine shut down");
    }
}

/// Point-in-time view of an engine
#[derive(Debug, Clone)]
pub struct EngineHealth {
    pub instance_id: String,
    pub circuit: CircuitState,
    pub tasks: TaskStats,
    pub bindings: Vec<ResourceStrategyBinding>,
}

/// On every event, log it and drop matching keys from the process-local level.
/// Events this instance published were already applied locally by the shared
/// store's cascade.
fn subscribe_local_eviction(
    bus: &InvalidationBus,
    local: &CacheStore,
    tasks: &BackgroundTasks,
    instance_id: &str,
) {
    let local = local.clone();
    let tasks = tasks.clone();
    let instance_id = instance_id.to_owned();
    bus.subscribe(move |event: InvalidationEvent| {
        info!(
            pattern = %event.pattern,
            reason = %event.reason,
            origin = event.origin.as_deref().unwrap_or("unknown"),
            published_at = %event.timestamp,
            "Invalidation received"
        );
        if event.origin.as_deref() == Some(instance_id.as_str()) {
            return;
        }
        let local = local.clone();
        let pattern = event.pattern.clone();
        // Handlers may run off the runtime (Redis hub thread), so queue rather than spawn
        tasks.submit("local_eviction", event.pattern, async move {
            let evicted = local.evict_matching(&pattern).await;
            debug!(pattern = %pattern, evicted, "Local level evicted");
            Ok(())
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        LocalPubSub,
        patterns::{backing_fn, tests::RecordingSource},
        store::tests::{Course, course},
    };
    use std::time::Duration;

    #[tokio::test]
    async fn own_invalidation_clears_both_levels() {
        let transport = LocalPubSub::new();
        let engine = CacheEngine::new(
            CacheConfig::default(),
            Arc::new(MemoryBackend::default()),
            Some(Arc::new(transport)),
        )
        .unwrap();
        let source = RecordingSource::with([("content:1", course(1))]);

        engine
            .execute(ExecuteRequest::read("content", "content:1", source.clone()))
            .await
            .unwrap();
        assert_eq!(engine.local().get::<Course>("content:1").await, Some(course(1)));

        assert!(engine.invalidate("content:*", "manual").await);
        assert_eq!(engine.local().get::<Course>("content:1").await, None);
        assert_eq!(engine.store().get::<Course>("content:1").await, None);
    }

    #[tokio::test]
    async fn store_invalidation_reaches_the_local_level() {
        let engine = CacheEngine::new(
            CacheConfig::default(),
            Arc::new(MemoryBackend::default()),
            Some(Arc::new(LocalPubSub::new())),
        )
        .unwrap();
        let source = RecordingSource::with([("content:2", course(2))]);
        engine
            .execute(ExecuteRequest::read("content", "content:2", source.clone()))
            .await
            .unwrap();
        assert_eq!(engine.local().get::<Course>("content:2").await, Some(course(2)));

        assert!(engine.store().invalidate_key("content:2", "removed from source").await);
        assert_eq!(engine.local().get::<Course>("content:2").await, None);
    }

    #[tokio::test]
    async fn malformed_patterns_do_not_trip_the_breaker() {
        let engine = CacheEngine::new(
            CacheConfig::default(),
            Arc::new(MemoryBackend::default()),
            None,
        )
        .unwrap();
        assert!(engine.local().set("k", &1u32, Duration::from_secs(60)).await);

        for _ in 0..10 {
            assert!(!engine.invalidate("course:[z-a]", "manual").await);
            assert_eq!(engine.local().evict_matching("course:[z-a]").await, 0);
        }
        assert_eq!(engine.local().circuit_state(), CircuitState::Closed);
        assert_eq!(engine.health().circuit, CircuitState::Closed);
        assert_eq!(engine.local().get::<u32>("k").await, Some(1));
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let config = CacheConfig {
            soft_ttl_ratio: 0.0,
            ..Default::default()
        };
        let err = CacheEngine::new(config, Arc::new(MemoryBackend::default()), None);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn health_reports_bindings_and_tasks() {
        let engine = CacheEngine::new(
            CacheConfig::default(),
            Arc::new(MemoryBackend::default()),
            None,
        )
        .unwrap();
        let loader = backing_fn(|_key: String| async { Ok(Some(7u32)) });
        engine
            .execute(
                ExecuteRequest::read("stats", "stats:1", loader).with_ttl(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(engine.ping().await);
        engine.shutdown().await;

        let health = engine.health();
        assert_eq!(health.circuit, CircuitState::Closed);
        assert_eq!(health.tasks.pending, 0);
        assert!(health.bindings.iter().any(|b| b.resource == "course"));
        assert_eq!(engine.resource_stats("stats").misses, 1);
    }
}
