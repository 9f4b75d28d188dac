use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use super::{BackingStore, Lookup};
use crate::{CacheError, CacheStore, store::Cacheable};

/// One level of a hierarchical chain, probed in order
#[derive(Clone)]
pub struct CacheLevel {
    pub store: CacheStore,
    pub ttl: Duration,
}

impl CacheLevel {
    pub fn new(store: CacheStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }
}

/// Probe `levels` in order. A hit at level `i` is returned at once and copied
/// into levels `0..i` by background jobs; a miss everywhere loads from
/// `backing` and populates every level before returning.
pub async fn hierarchical<T: Cacheable>(
    levels: &[CacheLevel],
    key: &str,
    backing: &dyn BackingStore<T>,
) -> Result<Lookup<T>, CacheError> {
    for (depth, level) in levels.iter().enumerate() {
        if let Some(value) = level.store.get::<T>(key).await {
            debug!(key = key, level = level.store.name(), depth, "Hierarchical hit");
            backfill(&levels[..depth], key, &value);
            return Ok(Lookup::hit(value));
        }
    }

    let value = backing.fetch(key).await?;
    if let Some(value) = &value {
        join_all(
            levels
                .iter()
                .map(|level| level.store.set(key, value, level.ttl)),
        )
        .await;
    }
    Ok(Lookup::miss(value))
}

fn backfill<T: Cacheable>(levels: &[CacheLevel], key: &str, value: &T) {
    for level in levels {
        let CacheLevel { store, ttl } = level.clone();
        let owned_key = key.to_owned();
        let value = value.clone();
        level.store.tasks().submit("backfill", key, async move {
            if !store.set(&owned_key, &value, ttl).await {
                debug!(key = %owned_key, level = store.name(), "Backfill skipped");
            }
            Ok(())
        });
    }
}
