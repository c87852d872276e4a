//! Janitor: keeps the index cache under its size budget.
//!
//! Runs for the lifetime of the service. Errors only ever show up in logs and
//! the eviction-error counter; the request path never waits on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{EvictionStats, Store};
use crate::config::SymbolsConfig;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct CacheEvicter {
    store: Arc<Store>,
    interval: Duration,
    max_bytes: u64,
    stale_after: Duration,
    metrics: Arc<Metrics>,
}

impl CacheEvicter {
    pub fn new(store: Arc<Store>, config: &SymbolsConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            interval: config.eviction_interval(),
            max_bytes: config.cache_size_bytes(),
            stale_after: config.processing_timeout(),
            metrics,
        }
    }

    /// Evict on every tick until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.interval.as_secs(),
            max_bytes = self.max_bytes,
            "Cache janitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let this = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || this.evict_once()).await {
                        warn!(error = %e, "Eviction pass panicked");
                        self.metrics.eviction_errors.inc();
                    }
                }
            }
        }
        info!("Cache janitor stopped");
    }

    /// One pass: evict down to the budget, publish the size gauge, then sweep
    /// abandoned build files.
    pub fn evict_once(&self) -> EvictionStats {
        let stats = match self.store.evict(self.max_bytes) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Failed to scan cache directory");
                self.metrics.eviction_errors.inc();
                return EvictionStats::default();
            }
        };

        self.metrics.cache_size_bytes.set(i64::try_from(stats.size_after).unwrap_or(i64::MAX));
        self.metrics.evictions.add(stats.evicted as u64);
        self.metrics.eviction_errors.add(stats.errors as u64);
        if stats.evicted > 0 || stats.errors > 0 {
            info!(
                size_before = stats.size_before,
                size_after = stats.size_after,
                evicted = stats.evicted,
                errors = stats.errors,
                "Evicted index files"
            );
        } else {
            debug!(size = stats.size_after, "Cache within budget");
        }

        match self.store.remove_stale_temp_files(self.stale_after) {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Removed stale build files"),
            Err(e) => warn!(error = %e, "Failed to sweep stale build files"),
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;
    use filetime::FileTime;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write_entry(dir: &Path, name: &str, size: usize, mtime_secs: i64) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, vec![b'x'; size]).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
        path
    }

    fn evicter(dir: &TempDir, max_bytes: u64) -> (CacheEvicter, Arc<Store>, Arc<Metrics>) {
        let config = test_config(dir.path());
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(Store::new(config.cache_dir.clone(), config.processing_timeout(), metrics.clone()));
        let mut evicter = CacheEvicter::new(store.clone(), &config, metrics.clone());
        evicter.max_bytes = max_bytes;
        evicter.interval = Duration::from_millis(20);
        (evicter, store, metrics)
    }

    #[test]
    fn test_evict_once_deletes_oldest_and_reports() {
        let dir = TempDir::new().unwrap();
        let (evicter, store, metrics) = evicter(&dir, 250);
        let repo_a = store.dir_for("repo-a");
        let repo_b = store.dir_for("repo-b");
        let oldest = write_entry(&repo_a, "1.db", 100, 1_000);
        let second = write_entry(&repo_b, "2.db", 100, 2_000);
        let third = write_entry(&repo_a, "3.db", 100, 3_000);
        let newest = write_entry(&repo_b, "4.db", 100, 4_000);

        let stats = evicter.evict_once();

        assert_eq!(stats.evicted, 2);
        assert!(!oldest.exists());
        assert!(!second.exists());
        assert!(third.exists());
        assert!(newest.exists());
        assert_eq!(metrics.cache_size_bytes.get(), 200);
        assert_eq!(metrics.evictions.get(), 2);
        assert_eq!(metrics.eviction_errors.get(), 0);
    }

    #[test]
    fn test_budget_holds_after_pass() {
        let dir = TempDir::new().unwrap();
        let (evicter, store, _) = evicter(&dir, 1_000);
        for i in 0..20 {
            write_entry(&store.dir_for(&format!("repo-{}", i % 3)), &format!("{}.db", i), 50 + i * 10, 1_000 + i as i64);
        }
        evicter.evict_once();
        let total: u64 = store.list_entries().unwrap().iter().map(|e| e.size_bytes).sum();
        assert!(total <= 1_000, "cache still at {} bytes", total);
    }

    #[test]
    fn test_empty_cache_is_fine() {
        let dir = TempDir::new().unwrap();
        let (evicter, _, metrics) = evicter(&dir, 10);
        let stats = evicter.evict_once();
        assert_eq!(stats, EvictionStats::default());
        assert_eq!(metrics.cache_size_bytes.get(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let (evicter, store, metrics) = evicter(&dir, 50);
        write_entry(&store.dir_for("repo"), "a.db", 100, 1_000);

        let cancel = CancellationToken::new();
        let task = {
            let evicter = evicter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { evicter.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(metrics.evictions.get(), 1);
        assert!(store.list_entries().unwrap().is_empty());
    }
}
