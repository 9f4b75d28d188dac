use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::debug;

use super::{BackingStore, Lookup};
use crate::{BoxError, CacheError, CacheStore, store::Cacheable};

/// First occurrence of each key from `keys` whose slot in `cached` is empty
fn missing_keys<T>(keys: &[String], cached: &[Option<T>]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .zip(cached)
        .filter(|(key, slot)| slot.is_none() && seen.insert(key.as_str()))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Batched read: one `mget`, one `fetch_many` for the distinct misses, then
/// cache whatever the source returned. Results follow the order of `keys`.
pub async fn read_through<T: Cacheable>(
    store: &CacheStore,
    keys: &[String],
    backing: &dyn BackingStore<T>,
    ttl: Duration,
) -> Result<Vec<Lookup<T>>, CacheError> {
    let cached = store.mget::<T>(keys).await;
    let missing = missing_keys(keys, &cached);
    if missing.is_empty() {
        return Ok(cached.into_iter().flatten().map(Lookup::hit).collect());
    }

    debug!(
        requested = keys.len(),
        missing = missing.len(),
        "Read-through fetching misses"
    );
    let fetched = backing.fetch_many(&missing).await?;
    join_all(fetched.iter().map(|(key, value)| store.set(key, value, ttl))).await;

    Ok(keys
        .iter()
        .zip(cached)
        .map(|(key, slot)| match slot {
            Some(value) => Lookup::hit(value),
            None => Lookup::miss(fetched.get(key).cloned()),
        })
        .collect())
}

/// Get-or-load on `key`. A miss also queues a prefetch of `prefetch_keys`
/// whose errors are logged by the task runner and never reach the caller.
pub async fn cache_aside_prefetch<T: Cacheable>(
    store: &CacheStore,
    key: &str,
    backing: Arc<dyn BackingStore<T>>,
    ttl: Duration,
    prefetch_keys: &[String],
) -> Result<Lookup<T>, CacheError> {
    if let Some(value) = store.get::<T>(key).await {
        return Ok(Lookup::hit(value));
    }

    let value = backing.fetch(key).await?;
    if let Some(value) = &value {
        store.set(key, value, ttl).await;
    }

    let related: Vec<String> = prefetch_keys
        .iter()
        .filter(|k| k.as_str() != key)
        .cloned()
        .collect();
    if !related.is_empty() {
        let store_for_job = store.clone();
        store.tasks().submit("prefetch", key, async move {
            prefetch(&store_for_job, &related, &*backing, ttl).await
        });
    }
    Ok(Lookup::miss(value))
}

async fn prefetch<T: Cacheable>(
    store: &CacheStore,
    keys: &[String],
    backing: &dyn BackingStore<T>,
    ttl: Duration,
) -> Result<(), BoxError> {
    let cached = store.mget::<T>(keys).await;
    let missing = missing_keys(keys, &cached);
    if missing.is_empty() {
        return Ok(());
    }
    let fetched = backing.fetch_many(&missing).await?;
    join_all(fetched.iter().map(|(key, value)| store.set(key, value, ttl))).await;
    debug!(
        requested = missing.len(),
        loaded = fetched.len(),
        "Prefetched related keys"
    );
    Ok(())
}

/// Serve the cached value at once; when at least `threshold` of its soft
/// lifetime is used up, reload it from `backing` in the background.
pub async fn refresh_ahead<T: Cacheable>(
    store: &CacheStore,
    key: &str,
    backing: Arc<dyn BackingStore<T>>,
    ttl: Duration,
    threshold: f64,
) -> Result<Lookup<T>, CacheError> {
    if let Some(entry) = store.get_entry::<T>(key).await {
        if entry.consumed_fraction() >= threshold {
            schedule_reload(store, key, backing, ttl);
        }
        return Ok(Lookup::hit(entry.data));
    }

    let value = backing.fetch(key).await?;
    if let Some(value) = &value {
        store.set(key, value, ttl).await;
    }
    Ok(Lookup::miss(value))
}

fn schedule_reload<T: Cacheable>(
    store: &CacheStore,
    key: &str,
    backing: Arc<dyn BackingStore<T>>,
    ttl: Duration,
) {
    let Some(guard) = store.try_begin_refresh(key) else {
        return;
    };
    debug!(key = key, "Refreshing ahead of expiry");
    let store_for_job = store.clone();
    let owned_key = key.to_owned();
    store.tasks().submit("refresh_ahead", key, async move {
        let _guard = guard;
        match backing.fetch(&owned_key).await? {
            Some(value) => {
                store_for_job.set(&owned_key, &value, ttl).await;
            }
            None => {
                store_for_job
                    .invalidate_key(&owned_key, "removed from source")
                    .await;
            }
        }
        Ok(())
    });
}
