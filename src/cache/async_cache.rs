//! Async cache with single-flight fetch deduplication

use super::ttl_cache::{CacheStats, TtlCache};
use crate::error::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

type PendingFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Inner<V> {
    cache: TtlCache<V>,
    pending: Mutex<HashMap<String, PendingFetch<V>>>,
}

impl<V> Inner<V> {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingFetch<V>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// TTL cache whose misses are filled by an async fetcher.
///
/// Concurrent [`AsyncCache::get_or_set`] calls for the same key share one
/// in-flight fetch. Successful results are cached; failures are not, so the
/// next caller retries.
pub struct AsyncCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for AsyncCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> AsyncCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self::from_cache(TtlCache::new(default_ttl, max_size))
    }

    pub fn from_cache(cache: TtlCache<V>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Underlying TTL cache
    pub fn cache(&self) -> &TtlCache<V> {
        &self.inner.cache
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.cache.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        self.inner.cache.set_with_ttl(key, value, ttl);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.cache.delete(key)
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    pub fn cleanup(&self) -> usize {
        self.inner.cache.cleanup()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Number of fetches currently in flight
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Return the cached value for `key`, or run `fetcher` to produce it.
    ///
    /// Returns `(value, hit)` where `hit` is true when no fetch was started
    /// or joined by this call.
    pub async fn get_or_set_with_hit<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Option<Duration>,
    ) -> Result<(V, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.inner.cache.get(key) {
            return Ok((value, true));
        }

        let fetch = {
            let mut pending = self.inner.pending();

            // The leader fills the cache before clearing its pending slot, so a
            // re-check under the pending lock cannot miss a just-finished fetch.
            if let Some(value) = self.inner.cache.get(key) {
                return Ok((value, true));
            }

            match pending.get(key) {
                Some(in_flight) => {
                    debug!(key, "Joining in-flight fetch");
                    in_flight.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let owned_key = key.to_string();
                    let fut = fetcher();
                    let shared = async move {
                        let result = fut.await;
                        if let Ok(value) = &result {
                            inner.cache.set_with_ttl(owned_key.clone(), value.clone(), ttl);
                        }
                        inner.pending().remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    pending.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        fetch.await.map(|value| (value, false))
    }

    /// Return the cached value for `key`, or run `fetcher` to produce it
    pub async fn get_or_set<F, Fut>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.get_or_set_with_hit(key, fetcher, ttl)
            .await
            .map(|(value, _)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_get_or_set_caches_value() {
        let cache: AsyncCache<String> = AsyncCache::new(Duration::from_secs(60), 10);

        let value = cache
            .get_or_set("k", || async { Ok("fetched".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(value, "fetched");

        let (again, hit) = cache
            .get_or_set_with_hit("k", || async { Ok("other".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(again, "fetched");
        assert!(hit);
    }

    #[tokio::test]
    async fn test_single_flight_runs_fetcher_once() {
        let cache: AsyncCache<u32> = AsyncCache::new(Duration::from_secs(60), 10);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set(
                        "shared",
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(42)
                        },
                        None,
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache: AsyncCache<u32> = AsyncCache::new(Duration::from_secs(60), 10);

        let first = cache
            .get_or_set(
                "k",
                || async { Err(RuntimeError::backend("test-model", "unavailable")) },
                None,
            )
            .await;
        assert!(first.is_err());
        assert_eq!(cache.pending_count(), 0);
        assert!(cache.get("k").is_none());

        let second = cache.get_or_set("k", || async { Ok(7) }, None).await;
        assert_eq!(second.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_explicit_ttl_applies_to_fetched_value() {
        let cache: AsyncCache<u32> = AsyncCache::new(Duration::from_secs(60), 10);
        cache
            .get_or_set("k", || async { Ok(1) }, Some(Duration::from_millis(30)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get("k").is_none());
    }
}
