use std::{sync::Arc, time::Duration};

use tracing::{debug, error, warn};

use super::BackingStore;
use crate::{CacheError, CacheStore, store::Cacheable};

/// Persist first, then cache. A persistence error is returned and the cache is
/// left untouched; the `bool` reports whether the cache write happened.
pub async fn write_through<T: Cacheable>(
    store: &CacheStore,
    key: &str,
    value: &T,
    backing: &dyn BackingStore<T>,
    ttl: Duration,
) -> Result<bool, CacheError> {
    backing.persist(key, value).await.map_err(|e| {
        warn!(key = key, error = %e, "Write-through persistence failed, cache not updated");
        CacheError::Backend(e)
    })?;
    let cached = store.set(key, value, ttl).await;
    debug!(key = key, cached, "Write-through complete");
    Ok(cached)
}

/// Cache now, persist later. The returned `bool` is the cache write; persistence
/// runs as a background job and evicts `key` if it fails.
pub async fn write_back<T: Cacheable>(
    store: &CacheStore,
    key: &str,
    value: T,
    backing: Arc<dyn BackingStore<T>>,
    ttl: Duration,
) -> bool {
    let cached = store.set(key, &value, ttl).await;

    let evict_from = store.clone();
    let owned_key = key.to_owned();
    let queued = store.tasks().submit("write_back", key, async move {
        if let Err(e) = backing.persist(&owned_key, &value).await {
            error!(key = %owned_key, error = %e, "Write-back persistence failed, evicting cached value");
            evict_from
                .invalidate_key(&owned_key, "write-back persistence failed")
                .await;
            return Err(e);
        }
        Ok(())
    });

    if !queued {
        // The value would never reach the source of truth; do not leave it cached
        warn!(key = key, "Write-back job dropped, evicting cached value");
        store
            .invalidate_key(key, "write-back persistence dropped")
            .await;
        return false;
    }
    cached
}

/// Persist only; the cache is not touched. Persistence failures are logged and
/// reported as `false`.
pub async fn write_around<T: Cacheable>(
    key: &str,
    value: &T,
    backing: &dyn BackingStore<T>,
) -> bool {
    match backing.persist(key, value).await {
        Ok(()) => true,
        Err(e) => {
            warn!(key = key, error = %e, "Write-around persistence failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CacheConfig, MemoryBackend,
        patterns::tests::RecordingSource,
        store::tests::{Course, course, store_over},
    };
    use std::sync::atomic::Ordering;

    const TTL: Duration = Duration::from_secs(300);

    fn store() -> CacheStore {
        store_over(Arc::new(MemoryBackend::default()), &CacheConfig::default())
    }

    #[tokio::test]
    async fn write_through_caches_only_after_persisting() {
        let store = store();
        let source = RecordingSource::<Course>::with([]);

        assert!(write_through(&store, "course:1", &course(1), &*source, TTL)
            .await
            .unwrap());
        assert_eq!(*source.persisted.lock(), vec!["course:1".to_owned()]);
        assert_eq!(store.get::<Course>("course:1").await, Some(course(1)));

        source.fail_persist.store(true, Ordering::SeqCst);
        let err = write_through(&store, "course:2", &course(2), &*source, TTL).await;
        assert!(matches!(err, Err(CacheError::Backend(_))));
        assert_eq!(store.get::<Course>("course:2").await, None);
    }

    #[tokio::test]
    async fn write_back_returns_before_persisting() {
        let store = store();
        let source = RecordingSource::<Course>::with([]);

        assert!(write_back(&store, "course:1", course(1), source.clone(), TTL).await);
        // The job cannot have run yet: the dispatcher only gets polled once we yield
        assert!(source.persisted.lock().is_empty());
        assert_eq!(store.get::<Course>("course:1").await, Some(course(1)));

        store.tasks().drain().await;
        assert_eq!(*source.persisted.lock(), vec!["course:1".to_owned()]);
        assert_eq!(store.get::<Course>("course:1").await, Some(course(1)));
    }

    #[tokio::test]
    async fn failed_write_back_evicts_the_key() {
        let store = store();
        let source = RecordingSource::<Course>::with([]);
        source.fail_persist.store(true, Ordering::SeqCst);

        assert!(write_back(&store, "course:7", course(7), source.clone(), TTL).await);

        store.tasks().drain().await;
        assert_eq!(store.get::<Course>("course:7").await, None);
        assert_eq!(store.tasks().stats().failed, 1);
    }

    #[tokio::test]
    async fn write_around_leaves_the_cache_alone() {
        let store = store();
        store.set("content:1", &"old".to_owned(), TTL).await;
        let source = RecordingSource::<String>::with([]);

        assert!(write_around("content:1", &"new".to_owned(), &*source).await);
        assert_eq!(store.get::<String>("content:1").await.as_deref(), Some("old"));
        assert_eq!(source.data.lock()["content:1"], "new");

        source.fail_persist.store(true, Ordering::SeqCst);
        assert!(!write_around("content:2", &"x".to_owned(), &*source).await);
    }
}
