//! Metrics registry, constructed once at startup and passed into each component.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// A value that goes up and down (sizes, in-flight counts).
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self { name, help, value: AtomicI64::new(0) }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment now, decrement when the returned guard is dropped.
    pub fn track(&self) -> GaugeGuard<'_> {
        self.inc();
        GaugeGuard { gauge: self }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }
}

pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// A monotonically increasing count.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self { name, help, value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }
}

#[derive(Debug)]
pub struct Metrics {
    pub cache_size_bytes: Gauge,
    pub evictions: Counter,
    pub eviction_errors: Counter,
    pub fetching: Gauge,
    pub fetch_queue_size: Gauge,
    pub indexing: Gauge,
    pub indexing_queue_size: Gauge,
    pub fetch_failed: Counter,
    pub builds: Counter,
    pub incremental_builds: Counter,
    pub build_failures: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub parse_errors: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_size_bytes: Gauge::new(
                "symbols_store_cache_size_bytes",
                "The total size of all index files in the cache directory.",
            ),
            evictions: Counter::new(
                "symbols_store_evictions",
                "The total number of index files evicted from the cache.",
            ),
            eviction_errors: Counter::new(
                "symbols_store_eviction_errors",
                "The total number of failed evictions.",
            ),
            fetching: Gauge::new("symbols_store_fetching", "The number of fetches currently running."),
            fetch_queue_size: Gauge::new("symbols_store_fetch_queue_size", "The number of fetch jobs enqueued."),
            indexing: Gauge::new("symbols_indexing", "The number of index builds currently writing."),
            indexing_queue_size: Gauge::new(
                "symbols_indexing_queue_size",
                "The number of index builds waiting for an indexing slot.",
            ),
            fetch_failed: Counter::new("symbols_store_fetch_failed", "The total number of archive fetches that failed."),
            builds: Counter::new("symbols_builds", "The total number of index builds started."),
            incremental_builds: Counter::new(
                "symbols_incremental_builds",
                "The total number of index builds that reused a base index.",
            ),
            build_failures: Counter::new("symbols_build_failures", "The total number of failed index builds."),
            cache_hits: Counter::new("symbols_cache_hits", "Requests served from an existing index file."),
            cache_misses: Counter::new("symbols_cache_misses", "Requests that had to wait for a build."),
            parse_errors: Counter::new("symbols_parse_errors", "Files the parser failed on."),
        }
    }

    /// Current value of every metric, keyed by its stable name.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let gauges = [
            &self.cache_size_bytes,
            &self.fetching,
            &self.fetch_queue_size,
            &self.indexing,
            &self.indexing_queue_size,
        ];
        let counters = [
            &self.evictions,
            &self.eviction_errors,
            &self.fetch_failed,
            &self.builds,
            &self.incremental_builds,
            &self.build_failures,
            &self.cache_hits,
            &self.cache_misses,
            &self.parse_errors,
        ];
        gauges
            .iter()
            .map(|g| MetricSample { name: g.name(), value: g.get() })
            .chain(counters.iter().map(|c| MetricSample {
                name: c.name(),
                value: i64::try_from(c.get()).unwrap_or(i64::MAX),
            }))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricSample {
    pub name: &'static str,
    pub value: i64,
}
