//! Read and write access patterns built on the [`CacheStore`] contract
//!
//! Each pattern is a free function over a store (or a chain of stores), a
//! key, an optional value and a [`BackingStore`] for the source of truth.

mod hierarchical;
mod read;
mod write;

use std::{
    collections::HashMap, fmt, future::Future, marker::PhantomData, str::FromStr, sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BoxError, CacheError, CacheStore};

pub use hierarchical::{CacheLevel, hierarchical};
pub use read::{cache_aside_prefetch, read_through, refresh_ahead};
pub use write::{write_around, write_back, write_through};

/// Named access patterns a resource can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pattern {
    WriteThrough,
    WriteBack,
    WriteAround,
    ReadThrough,
    CacheAside,
    RefreshAhead,
    Hierarchical,
}

impl Pattern {
    pub const ALL: [Pattern; 7] = [
        Pattern::WriteThrough,
        Pattern::WriteBack,
        Pattern::WriteAround,
        Pattern::ReadThrough,
        Pattern::CacheAside,
        Pattern::RefreshAhead,
        Pattern::Hierarchical,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Pattern::WriteThrough => "write-through",
            Pattern::WriteBack => "write-back",
            Pattern::WriteAround => "write-around",
            Pattern::ReadThrough => "read-through",
            Pattern::CacheAside => "cache-aside",
            Pattern::RefreshAhead => "refresh-ahead",
            Pattern::Hierarchical => "hierarchical",
        }
    }

    pub const fn is_read(self) -> bool {
        matches!(
            self,
            Pattern::ReadThrough
                | Pattern::CacheAside
                | Pattern::RefreshAhead
                | Pattern::Hierarchical
        )
    }

    pub const fn is_write(self) -> bool {
        !self.is_read()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pattern {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Pattern::ALL
            .into_iter()
            .find(|p| p.name() == normalized)
            .ok_or_else(|| CacheError::InvalidStrategy(format!("unknown cache pattern '{s}'")))
    }
}

/// Read and write pattern bound to a resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStrategyBinding {
    pub resource: String,
    pub read_pattern: Pattern,
    pub write_pattern: Pattern,
}

impl ResourceStrategyBinding {
    pub fn new(resource: impl Into<String>, read_pattern: Pattern, write_pattern: Pattern) -> Self {
        Self {
            resource: resource.into(),
            read_pattern,
            write_pattern,
        }
    }

    /// Reject bindings whose patterns cannot serve their slot
    pub fn check(&self) -> Result<(), CacheError> {
        if !self.read_pattern.is_read() {
            return Err(CacheError::InvalidStrategy(format!(
                "'{}' is not a read pattern (resource '{}')",
                self.read_pattern, self.resource
            )));
        }
        if !self.write_pattern.is_write() {
            return Err(CacheError::InvalidStrategy(format!(
                "'{}' is not a write pattern (resource '{}')",
                self.write_pattern, self.resource
            )));
        }
        Ok(())
    }
}

/// Source of truth behind the cache (database, HTTP service, ...)
#[async_trait]
pub trait BackingStore<T: Send + Sync>: Send + Sync {
    /// Load one value; `Ok(None)` when the source has nothing for `key`
    async fn fetch(&self, key: &str) -> Result<Option<T>, BoxError>;

    /// Load several values in one round-trip. Keys without a value are left out.
    ///
    /// The default issues one `fetch` per key; sources with a bulk query should override it.
    async fn fetch_many(&self, keys: &[String]) -> Result<HashMap<String, T>, BoxError> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.fetch(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    /// Persist a value. Read-only sources keep the default, which fails.
    async fn persist(&self, key: &str, _value: &T) -> Result<(), BoxError> {
        Err(format!("backing store is read-only, cannot persist {key}").into())
    }
}

/// [`BackingStore`] from an async loader closure; read-only
pub struct FnBackingStore<T, F> {
    load: F,
    _value: PhantomData<fn() -> T>,
}

/// Wrap `load` as a shared, read-only [`BackingStore`]
pub fn backing_fn<T, F, Fut>(load: F) -> Arc<dyn BackingStore<T>>
where
    T: Send + Sync + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<T>, BoxError>> + Send + 'static,
{
    Arc::new(FnBackingStore {
        load,
        _value: PhantomData,
    })
}

#[async_trait]
impl<T, F, Fut> BackingStore<T> for FnBackingStore<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<T>, BoxError>> + Send + 'static,
{
    async fn fetch(&self, key: &str) -> Result<Option<T>, BoxError> {
        (self.load)(key.to_owned()).await
    }
}

/// Result of a single-key read with its cache outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<T> {
    pub value: Option<T>,
    /// Served from a cache level rather than the backing store
    pub hit: bool,
}

impl<T> Lookup<T> {
    pub fn hit(value: T) -> Self {
        Self {
            value: Some(value),
            hit: true,
        }
    }

    pub fn miss(value: Option<T>) -> Self {
        Self { value, hit: false }
    }
}

/// Default two-level chain: process-local store, then the shared store
pub fn default_levels(
    local: &CacheStore,
    local_ttl: Duration,
    shared: &CacheStore,
    ttl: Duration,
) -> Vec<CacheLevel> {
    vec![
        CacheLevel::new(local.clone(), local_ttl.min(ttl)),
        CacheLevel::new(shared.clone(), ttl),
    ]
}
