//! Service configuration: every tunable with its default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SymbolsError;

/// Maximum size of a file we attempt to parse (512 KiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 19;

/// Maximum sum of path bytes in a diff for incremental indexing. Bigger diffs
/// are rebuilt from scratch: the changed paths are sent to the archive source
/// as an explicit list, and request lines/headers start failing somewhere
/// between 372KB and 450KB.
pub const DEFAULT_MAX_TOTAL_PATHS_LENGTH: usize = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SymbolsConfig {
    /// Root directory of the index cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Eviction budget in MB (1 MB = 1,000,000 bytes)
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,

    /// Seconds between janitor passes
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Background timeout for a single build
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,

    /// Request-scoped timeout for a search, including build-on-demand
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum archive fetches in flight across all builds
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Maximum index builds writing at once
    #[serde(default = "default_max_concurrent_indexing")]
    pub max_concurrent_indexing: usize,

    #[serde(default = "default_num_parser_workers")]
    pub num_parser_workers: usize,

    /// Capacity of the parse-request and symbol channels
    #[serde(default = "default_request_buffer_size")]
    pub request_buffer_size: usize,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_max_total_paths_length")]
    pub max_total_paths_length: usize,
}

fn default_cache_dir() -> PathBuf {
    let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("symbols")
}

fn default_cache_size_mb() -> u64 {
    100_000
}

fn default_eviction_interval_secs() -> u64 {
    10
}

fn default_processing_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_fetches() -> usize {
    15
}

fn default_max_concurrent_indexing() -> usize {
    10
}

fn default_num_parser_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_request_buffer_size() -> usize {
    8192
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_total_paths_length() -> usize {
    DEFAULT_MAX_TOTAL_PATHS_LENGTH
}

impl Default for SymbolsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_size_mb: default_cache_size_mb(),
            eviction_interval_secs: default_eviction_interval_secs(),
            processing_timeout_secs: default_processing_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            max_concurrent_indexing: default_max_concurrent_indexing(),
            num_parser_workers: default_num_parser_workers(),
            request_buffer_size: default_request_buffer_size(),
            max_file_size: default_max_file_size(),
            max_total_paths_length: default_max_total_paths_length(),
        }
    }
}

impl SymbolsConfig {
    pub fn validate(&self) -> Result<(), SymbolsError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(SymbolsError::InvalidConfig("cache_dir must not be empty".to_string()));
        }
        let positive = [
            ("cache_size_mb", self.cache_size_mb),
            ("eviction_interval_secs", self.eviction_interval_secs),
            ("processing_timeout_secs", self.processing_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("max_concurrent_fetches", self.max_concurrent_fetches as u64),
            ("max_concurrent_indexing", self.max_concurrent_indexing as u64),
            ("num_parser_workers", self.num_parser_workers as u64),
            ("request_buffer_size", self.request_buffer_size as u64),
            ("max_file_size", self.max_file_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SymbolsError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size_mb.saturating_mul(1_000_000)
    }

    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    #[must_use]
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
