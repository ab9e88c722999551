//! Background sweeping of expired cache entries

use super::async_cache::AsyncCache;
use super::ttl_cache::TtlCache;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Anything that can drop its expired entries
pub trait Sweepable: Send + Sync {
    fn sweep_name(&self) -> &str;

    /// Remove expired entries, returning how many were dropped
    fn sweep(&self) -> usize;
}

impl<V: Clone + Send> Sweepable for TtlCache<V> {
    fn sweep_name(&self) -> &str {
        self.name()
    }

    fn sweep(&self) -> usize {
        self.cleanup()
    }
}

impl<V: Clone + Send + Sync + 'static> Sweepable for AsyncCache<V> {
    fn sweep_name(&self) -> &str {
        self.cache().name()
    }

    fn sweep(&self) -> usize {
        self.cleanup()
    }
}

/// Periodic sweeper running on its own task
pub struct CacheSweeper {
    targets: Vec<Arc<dyn Sweepable>>,
    interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl CacheSweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            targets: Vec::new(),
            interval,
            metrics: None,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn Sweepable>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sweep every target once, returning the total removed
    pub fn sweep_all(&self) -> usize {
        self.targets
            .iter()
            .map(|target| {
                let removed = target.sweep();
                if let Some(metrics) = &self.metrics {
                    metrics.record_sweep(target.sweep_name(), removed);
                }
                removed
            })
            .sum()
    }

    /// Run until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            info!(targets = self.targets.len(), interval = ?self.interval, "Cache sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_all();
                        debug!(removed, "Cache sweep finished");
                    }
                }
            }
            info!("Cache sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(TtlCache::named("test", Duration::from_millis(20), 10));
        cache.set("a", 1);
        cache.set("b", 2);

        let shutdown = CancellationToken::new();
        let handle = CacheSweeper::new(Duration::from_millis(30))
            .with_target(cache.clone())
            .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.len(), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_sweep_all_counts_removed() {
        let first = Arc::new(TtlCache::named("first", Duration::from_millis(10), 10));
        let second = Arc::new(TtlCache::named("second", Duration::from_secs(60), 10));
        first.set("a", 1);
        second.set("b", 2);

        std::thread::sleep(Duration::from_millis(30));

        let sweeper = CacheSweeper::new(Duration::from_secs(1))
            .with_target(first)
            .with_target(second.clone());
        assert_eq!(sweeper.sweep_all(), 1);
        assert_eq!(sweeper.sweep_all(), 0);
        assert_eq!(second.len(), 1);
    }
}
