//! # symbols: per-commit symbol index and search
//!
//! Builds (or reuses) a queryable index of code symbols for a repository at a
//! given commit and answers name/regex queries against it.
//!
//! ## Library usage
//!
//! The `symbols` binary is a thin CLI over this library. The pieces, leaves first:
//! [`fetcher`] streams parse requests out of a tree archive, [`parser`] turns
//! them into [`Symbol`]s, [`writer`] persists them into a per-commit index file
//! (incrementally when a recent base exists), [`cache`] guarantees one build per
//! key, [`janitor`] keeps the cache under its size budget and [`search`] runs
//! queries against a built file. [`service`] wires them together.

use serde::{Deserialize, Serialize};

pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod gitserver;
pub mod janitor;
pub mod metrics;
pub mod parser;
pub mod search;
pub mod service;
pub mod store;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::SymbolsConfig;
pub use error::{Result, SymbolsError};
pub use metrics::Metrics;
pub use service::{setup, Searcher};

/// Version of the on-disk index layout. Part of every cache key, so bumping it
/// makes all previously built files unreachable (the janitor reclaims them).
pub const SCHEMA_VERSION: u32 = 1;

/// Result cap applied when [`SearchArgs::first`] is unset or non-positive.
pub const DEFAULT_FIRST: usize = 100;

// ─── Core public types ───────────────────────────────────────────────

/// A symbol query against one repository at one commit.
///
/// Fully determines both the cache key (repo + commit) and the query plan.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchArgs {
    pub repo: String,
    #[serde(rename = "commitID")]
    pub commit_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default, rename = "isRegExp")]
    pub is_regexp: bool,
    #[serde(default)]
    pub is_case_sensitive: bool,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_pattern: String,
    #[serde(default)]
    pub first: i32,
}

impl SearchArgs {
    /// Effective result cap: `first`, or [`DEFAULT_FIRST`] when non-positive.
    #[must_use]
    pub fn limit(&self) -> usize {
        if self.first > 0 {
            self.first as usize
        } else {
            DEFAULT_FIRST
        }
    }
}

/// A single code symbol: the unit of storage and of a search result.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    pub name: String,
    pub path: String,
    pub line: u32,
    pub kind: String,
    #[serde(default)]
    pub parent: String,
}

/// One eligible file pulled out of a tree archive, ready to be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRequest {
    pub path: String,
    pub data: Vec<u8>,
}

/// Path-level diff between two commits.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl Changes {
    /// Every path touched by the diff, in added/modified/deleted order.
    pub fn all_paths(&self) -> Vec<String> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .cloned()
            .collect()
    }

    /// Paths that exist at the target commit and have to be re-parsed.
    pub fn paths_to_fetch(&self) -> Vec<String> {
        self.added.iter().chain(&self.modified).cloned().collect()
    }

    /// Sum of the byte lengths of every touched path.
    #[must_use]
    pub fn total_paths_length(&self) -> usize {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .map(String::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}
