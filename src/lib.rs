//! adaptive-cache - Strategy-driven caching engine
//!
//! Sits between application code and a shared key-value backend and offers
//! several consistency/performance trade-offs per resource type:
//! - Write-through, write-back and write-around writes
//! - Batched read-through, cache-aside with prefetch, refresh-ahead and
//!   hierarchical (process-local, then shared) reads
//!
//! Every backend call goes through a circuit breaker and fails open, so a
//! cache outage shows up as misses rather than errors. Explicit invalidations
//! are broadcast to every instance over Redis pub/sub (or an in-process
//! transport), and each instance evicts the matching keys from its local level.
//! Deferred work (write-back persistence, refreshes, prefetch, backfill) runs
//! on a bounded background queue.

mod backend;
mod bus;
mod circuit_breaker;
mod codec;
mod config;
mod engine;
mod error;
pub mod logging;
pub mod patterns;
mod pubsub_hub;
mod redis_backend;
mod store;
mod strategy;
mod tasks;

pub use backend::{KvBackend, MemoryBackend};
pub use bus::{InvalidationBus, InvalidationEvent, InvalidationTransport, LocalPubSub, PayloadHandler};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use codec::{COMPRESSED_MARKER, CacheEntry, Codec};
pub use config::{CacheConfig, OptimizerConfig, default_strategies, parse_strategy_table};
pub use engine::{CacheEngine, EngineHealth};
pub use error::{BoxError, CacheError};
pub use patterns::{BackingStore, Lookup, Pattern, ResourceStrategyBinding, backing_fn};
pub use pubsub_hub::RedisPubSub;
pub use redis_backend::RedisBackend;
pub use store::{CacheStore, Cacheable, RefreshGuard, Refresher, escape_glob, refresher};
pub use strategy::{
    AccessMetadata, CacheKeys, ExecuteOptions, ExecuteRequest, Operation, OperationKind, Outcome,
    ResourceStats, StrategyManager,
};
pub use tasks::{BackgroundTasks, TaskStats};

// Re-export async_trait for implementing `BackingStore` and `KvBackend`
pub use async_trait::async_trait;
