//! Strategy manager
//!
//! Resolves a read or write pattern per resource, applies per-call overrides
//! from [`AccessMetadata`], dispatches to the pattern library and keeps
//! per-resource counters that drive [`StrategyManager::optimize_strategy`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    CacheConfig, CacheError, CacheStore,
    config::OptimizerConfig,
    patterns::{
        self, BackingStore, CacheLevel, Lookup, Pattern, ResourceStrategyBinding, default_levels,
    },
    store::Cacheable,
};

/// Kind of access requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// Read, or write of a value
#[derive(Debug, Clone)]
pub enum Operation<T> {
    Read,
    Write(T),
}

impl<T> Operation<T> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Read => OperationKind::Read,
            Operation::Write(_) => OperationKind::Write,
        }
    }
}

/// One key, or a batch of keys for read-through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKeys {
    One(String),
    Many(Vec<String>),
}

impl CacheKeys {
    fn single(&self) -> Option<&str> {
        match self {
            CacheKeys::One(key) => Some(key),
            CacheKeys::Many(_) => None,
        }
    }

    fn label(&self) -> String {
        match self {
            CacheKeys::One(key) => key.clone(),
            CacheKeys::Many(keys) => format!("[{} keys]", keys.len()),
        }
    }
}

impl From<&str> for CacheKeys {
    fn from(key: &str) -> Self {
        CacheKeys::One(key.to_owned())
    }
}

impl From<String> for CacheKeys {
    fn from(key: String) -> Self {
        CacheKeys::One(key)
    }
}

impl From<Vec<String>> for CacheKeys {
    fn from(keys: Vec<String>) -> Self {
        CacheKeys::Many(keys)
    }
}

/// Hints about how a call should trade consistency for speed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessMetadata {
    /// Writes go through the source of truth before the cache
    pub critical_consistency: bool,
    pub high_write: bool,
    pub high_read: bool,
}

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Defaults to `CacheConfig::default_ttl`
    pub ttl: Option<Duration>,
    pub metadata: AccessMetadata,
    /// Related keys loaded after a cache-aside miss
    pub prefetch_keys: Vec<String>,
    /// Defaults to `CacheConfig::refresh_threshold`
    pub refresh_threshold: Option<f64>,
    /// Level chain for hierarchical reads; defaults to process-local then shared
    pub levels: Option<Vec<CacheLevel>>,
}

/// A single call to [`StrategyManager::execute`]
pub struct ExecuteRequest<T> {
    pub resource: String,
    pub operation: Operation<T>,
    pub keys: CacheKeys,
    pub backing: Arc<dyn BackingStore<T>>,
    pub options: ExecuteOptions,
}

impl<T> ExecuteRequest<T> {
    pub fn read(
        resource: impl Into<String>,
        keys: impl Into<CacheKeys>,
        backing: Arc<dyn BackingStore<T>>,
    ) -> Self {
        Self {
            resource: resource.into(),
            operation: Operation::Read,
            keys: keys.into(),
            backing,
            options: ExecuteOptions::default(),
        }
    }

    pub fn write(
        resource: impl Into<String>,
        key: impl Into<String>,
        value: T,
        backing: Arc<dyn BackingStore<T>>,
    ) -> Self {
        Self {
            resource: resource.into(),
            operation: Operation::Write(value),
            keys: CacheKeys::One(key.into()),
            backing,
            options: ExecuteOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = Some(ttl);
        self
    }

    pub fn with_metadata(mut self, metadata: AccessMetadata) -> Self {
        self.options.metadata = metadata;
        self
    }
}

/// Result of [`StrategyManager::execute`]
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Single(Lookup<T>),
    Batch(Vec<Lookup<T>>),
    /// Write accepted; `true` when the pattern's cache or persistence step took effect
    Written(bool),
}

impl<T> Outcome<T> {
    /// Value of a single-key read
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Single(lookup) => lookup.value,
            Outcome::Batch(_) | Outcome::Written(_) => None,
        }
    }

    /// Values of a read in key order
    pub fn into_values(self) -> Vec<Option<T>> {
        match self {
            Outcome::Single(lookup) => vec![lookup.value],
            Outcome::Batch(lookups) => lookups.into_iter().map(|l| l.value).collect(),
            Outcome::Written(_) => Vec::new(),
        }
    }

    pub fn is_hit(&self) -> bool {
        match self {
            Outcome::Single(lookup) => lookup.hit,
            Outcome::Batch(lookups) => !lookups.is_empty() && lookups.iter().all(|l| l.hit),
            Outcome::Written(_) => false,
        }
    }
}

/// Per-resource counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl ResourceStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    fn operations(&self) -> u64 {
        self.reads + self.writes
    }
}

pub struct StrategyManager {
    shared: CacheStore,
    local: CacheStore,
    bindings: RwLock<HashMap<String, ResourceStrategyBinding>>,
    fallback_read: Pattern,
    fallback_write: Pattern,
    stats: DashMap<String, ResourceStats>,
    default_ttl: Duration,
    local_ttl: Duration,
    refresh_threshold: f64,
    optimizer: OptimizerConfig,
}

impl StrategyManager {
    /// Seeded with `config.strategies`; `local` is the process-local level of hierarchical reads
    pub fn new(config: &CacheConfig, shared: CacheStore, local: CacheStore) -> Self {
        let bindings = config
            .strategies
            .iter()
            .map(|b| (b.resource.clone(), b.clone()))
            .collect();
        Self {
            shared,
            local,
            bindings: RwLock::new(bindings),
            fallback_read: config.fallback_read_pattern,
            fallback_write: config.fallback_write_pattern,
            stats: DashMap::new(),
            default_ttl: config.default_ttl,
            local_ttl: config.l1_ttl,
            refresh_threshold: config.refresh_threshold,
            optimizer: config.optimizer.clone(),
        }
    }

    /// Current binding for `resource`, or the fallback binding when it has none
    pub fn binding(&self, resource: &str) -> ResourceStrategyBinding {
        self.bindings.read().get(resource).cloned().unwrap_or_else(|| {
            ResourceStrategyBinding::new(resource, self.fallback_read, self.fallback_write)
        })
    }

    pub fn bindings(&self) -> Vec<ResourceStrategyBinding> {
        let mut all: Vec<_> = self.bindings.read().values().cloned().collect();
        all.sort_by(|a, b| a.resource.cmp(&b.resource));
        all
    }

    /// Pattern for one call. Critical consistency beats high-write on writes.
    pub fn resolve(&self, resource: &str, kind: OperationKind, metadata: &AccessMetadata) -> Pattern {
        match kind {
            OperationKind::Write if metadata.critical_consistency => Pattern::WriteThrough,
            OperationKind::Write if metadata.high_write => Pattern::WriteBack,
            OperationKind::Read if metadata.high_read => Pattern::ReadThrough,
            OperationKind::Write => self.binding(resource).write_pattern,
            OperationKind::Read => self.binding(resource).read_pattern,
        }
    }

    /// Rebind `resource` at runtime
    pub fn update_resource_strategy(
        &self,
        resource: &str,
        read_pattern: Pattern,
        write_pattern: Pattern,
    ) -> Result<(), CacheError> {
        let binding = ResourceStrategyBinding::new(resource, read_pattern, write_pattern);
        binding.check()?;
        info!(
            resource = resource,
            read = %read_pattern,
            write = %write_pattern,
            "Resource strategy updated"
        );
        self.bindings.write().insert(resource.to_owned(), binding);
        Ok(())
    }

    /// [`StrategyManager::update_resource_strategy`] with pattern names, e.g. `"cache-aside"`
    pub fn update_resource_strategy_by_name(
        &self,
        resource: &str,
        read_pattern: &str,
        write_pattern: &str,
    ) -> Result<(), CacheError> {
        self.update_resource_strategy(resource, read_pattern.parse()?, write_pattern.parse()?)
    }

    pub fn resource_stats(&self, resource: &str) -> ResourceStats {
        self.stats.get(resource).map(|s| *s).unwrap_or_default()
    }

    /// Retune the binding of `resource` from its counters. Returns the new
    /// binding when it changed; `None` below `min_samples` or when nothing moved.
    pub fn optimize_strategy(&self, resource: &str) -> Option<ResourceStrategyBinding> {
        let stats = self.resource_stats(resource);
        let total = stats.operations();
        if total < self.optimizer.min_samples {
            debug!(resource = resource, samples = total, "Not enough samples to optimize");
            return None;
        }

        let current = self.binding(resource);
        let mut next = current.clone();
        let write_ratio = stats.writes as f64 / total as f64;
        let read_ratio = stats.reads as f64 / total as f64;

        if write_ratio >= self.optimizer.high_write_ratio {
            next.write_pattern = if stats.hit_rate() < self.optimizer.low_hit_rate {
                Pattern::WriteAround
            } else {
                Pattern::WriteBack
            };
        }
        if read_ratio >= self.optimizer.high_read_ratio {
            next.read_pattern = Pattern::ReadThrough;
        }

        if next == current {
            return None;
        }
        info!(
            resource = resource,
            read = %next.read_pattern,
            write = %next.write_pattern,
            hit_rate = stats.hit_rate(),
            write_ratio,
            "Resource strategy optimized"
        );
        self.bindings.write().insert(resource.to_owned(), next.clone());
        Some(next)
    }

    /// Resolve a pattern for the request and run it
    pub async fn execute<T: Cacheable>(
        &self,
        request: ExecuteRequest<T>,
    ) -> Result<Outcome<T>, CacheError> {
        let kind = request.operation.kind();
        let pattern = self.resolve(&request.resource, kind, &request.options.metadata);
        let resource = request.resource.clone();
        debug!(
            resource = %resource,
            pattern = %pattern,
            keys = %request.keys.label(),
            "Executing cache strategy"
        );

        let result = self.dispatch(pattern, request).await;
        self.record(&resource, kind, &result);
        if let Err(e) = &result {
            warn!(resource = %resource, pattern = %pattern, error = %e, "Cache strategy failed");
        }
        result
    }

    /// Run independent requests concurrently; each gets its own result
    pub async fn batch_execute<T: Cacheable>(
        &self,
        requests: Vec<ExecuteRequest<T>>,
    ) -> Vec<Result<Outcome<T>, CacheError>> {
        join_all(requests.into_iter().map(|r| self.execute(r))).await
    }

    async fn dispatch<T: Cacheable>(
        &self,
        pattern: Pattern,
        request: ExecuteRequest<T>,
    ) -> Result<Outcome<T>, CacheError> {
        let ExecuteRequest {
            resource,
            operation,
            keys,
            backing,
            options,
        } = request;
        let ttl = options.ttl.unwrap_or(self.default_ttl);

        match operation {
            Operation::Read => match (pattern, keys) {
                (Pattern::ReadThrough, CacheKeys::One(key)) => {
                    let mut found =
                        patterns::read_through(&self.shared, &[key], &*backing, ttl).await?;
                    Ok(Outcome::Single(found.pop().unwrap_or(Lookup::miss(None))))
                }
                (Pattern::ReadThrough, CacheKeys::Many(keys)) => {
                    let found = patterns::read_through(&self.shared, &keys, &*backing, ttl).await?;
                    Ok(Outcome::Batch(found))
                }
                (Pattern::CacheAside, CacheKeys::One(key)) => {
                    patterns::cache_aside_prefetch(
                        &self.shared,
                        &key,
                        backing,
                        ttl,
                        &options.prefetch_keys,
                    )
                    .await
                    .map(Outcome::Single)
                }
                (Pattern::RefreshAhead, CacheKeys::One(key)) => {
                    let threshold = options.refresh_threshold.unwrap_or(self.refresh_threshold);
                    patterns::refresh_ahead(&self.shared, &key, backing, ttl, threshold)
                        .await
                        .map(Outcome::Single)
                }
                (Pattern::Hierarchical, CacheKeys::One(key)) => {
                    let levels = options.levels.unwrap_or_else(|| {
                        default_levels(&self.local, self.local_ttl, &self.shared, ttl)
                    });
                    patterns::hierarchical(&levels, &key, &*backing)
                        .await
                        .map(Outcome::Single)
                }
                (pattern, CacheKeys::Many(_)) if pattern.is_read() => Err(CacheError::InvalidRequest(
                    format!("'{pattern}' reads one key at a time (resource '{resource}')"),
                )),
                (pattern, _) => Err(CacheError::InvalidStrategy(format!(
                    "'{pattern}' cannot serve reads (resource '{resource}')"
                ))),
            },
            Operation::Write(value) => {
                let Some(key) = keys.single() else {
                    return Err(CacheError::InvalidRequest(format!(
                        "writes take exactly one key (resource '{resource}')"
                    )));
                };
                // Keep this process's own reads consistent with the write
                self.local.evict_key(key).await;
                let done = match pattern {
                    Pattern::WriteThrough => {
                        patterns::write_through(&self.shared, key, &value, &*backing, ttl).await?
                    }
                    Pattern::WriteBack => {
                        patterns::write_back(&self.shared, key, value, backing, ttl).await
                    }
                    Pattern::WriteAround => patterns::write_around(key, &value, &*backing).await,
                    other => {
                        return Err(CacheError::InvalidStrategy(format!(
                            "'{other}' cannot serve writes (resource '{resource}')"
                        )));
                    }
                };
                Ok(Outcome::Written(done))
            }
        }
    }

    fn record<T>(&self, resource: &str, kind: OperationKind, result: &Result<Outcome<T>, CacheError>) {
        let mut stats = self.stats.entry(resource.to_owned()).or_default();
        match kind {
            OperationKind::Read => stats.reads += 1,
            OperationKind::Write => stats.writes += 1,
        }
        match result {
            Ok(Outcome::Single(lookup)) => tally(&mut stats, lookup),
            Ok(Outcome::Batch(lookups)) => lookups.iter().for_each(|l| tally(&mut stats, l)),
            Ok(Outcome::Written(_)) => {}
            Err(_) => stats.errors += 1,
        }
    }
}

fn tally<T>(stats: &mut ResourceStats, lookup: &Lookup<T>) {
    if lookup.hit {
        stats.hits += 1;
    } else {
        stats.misses += 1;
    }
}
