//! Unified error type for indexing and search.

use std::time::Duration;

use thiserror::Error;

/// All errors that can occur while fetching, building, caching or searching.
#[derive(Error, Debug)]
pub enum SymbolsError {
    /// I/O error (file read/write, directory access, rename)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index file could not be read or written
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid regex pattern in a query or path filter
    #[error("Invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The caller gave up (cancellation token fired)
    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    /// Archive or diff source failed or was unreachable
    #[error("upstream error for {repo}@{commit}: {message}")]
    Upstream {
        repo: String,
        commit: String,
        message: String,
    },

    /// The tar stream was malformed or an entry could not be read
    #[error("archive error for {repo}@{commit}: {message}")]
    Archive {
        repo: String,
        commit: String,
        message: String,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    /// An in-flight build this caller joined has failed
    #[error("build for cache key '{key}' failed: {message}")]
    BuildFailed { key: String, message: String },

    /// Mutually exclusive flags or other argument validation error
    #[error("{0}")]
    InvalidArgs(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A spawned task panicked or was aborted
    #[error("task failed: {0}")]
    TaskJoin(String),
}

impl SymbolsError {
    /// Transient failures the caller may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Timeout { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tokio::task::JoinError> for SymbolsError {
    fn from(err: tokio::task::JoinError) -> Self {
        SymbolsError::TaskJoin(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SymbolsError>;
