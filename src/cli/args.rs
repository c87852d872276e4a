//! CLI argument structs for all subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, ValueEnum};
use symbols::{SearchArgs, SymbolsConfig};

/// Log output format for stderr diagnostics.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Service settings shared by every subcommand. Unset values fall back to the
/// environment, then to [`SymbolsConfig::default`].
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Root directory of the index cache
    #[arg(long, env = "SYMBOLS_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Eviction budget in MB
    #[arg(long, env = "SYMBOLS_CACHE_SIZE_MB")]
    pub cache_size_mb: Option<u64>,

    /// Seconds between janitor passes
    #[arg(long, env = "SYMBOLS_EVICTION_INTERVAL_SECS")]
    pub eviction_interval_secs: Option<u64>,

    /// Background timeout for a single index build, in seconds
    #[arg(long, env = "SYMBOLS_PROCESSING_TIMEOUT_SECS")]
    pub processing_timeout_secs: Option<u64>,

    /// Timeout for a search request, including building on demand
    #[arg(long, env = "SYMBOLS_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[arg(long, env = "SYMBOLS_MAX_CONCURRENT_FETCHES")]
    pub max_concurrent_fetches: Option<usize>,

    /// Index builds allowed to write at the same time
    #[arg(long, env = "SYMBOLS_MAX_CONCURRENT_INDEXING")]
    pub max_concurrent_indexing: Option<usize>,

    #[arg(long, env = "SYMBOLS_NUM_PARSER_WORKERS")]
    pub num_parser_workers: Option<usize>,

    #[arg(long, env = "SYMBOLS_REQUEST_BUFFER_SIZE")]
    pub request_buffer_size: Option<usize>,

    /// Files bigger than this many bytes are not parsed
    #[arg(long, env = "SYMBOLS_MAX_FILE_SIZE")]
    pub max_file_size: Option<u64>,

    /// Diffs whose paths add up to more bytes than this are rebuilt from scratch
    #[arg(long, env = "SYMBOLS_MAX_TOTAL_PATHS_LENGTH")]
    pub max_total_paths_length: Option<usize>,

    /// Directory holding repositories by name (default: repo names are paths)
    #[arg(long, env = "SYMBOLS_REPOS_ROOT")]
    pub repos_root: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl CommonArgs {
    pub fn to_config(&self) -> SymbolsConfig {
        let defaults = SymbolsConfig::default();
        SymbolsConfig {
            cache_dir: self.cache_dir.clone().unwrap_or(defaults.cache_dir),
            cache_size_mb: self.cache_size_mb.unwrap_or(defaults.cache_size_mb),
            eviction_interval_secs: self.eviction_interval_secs.unwrap_or(defaults.eviction_interval_secs),
            processing_timeout_secs: self.processing_timeout_secs.unwrap_or(defaults.processing_timeout_secs),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(defaults.request_timeout_secs),
            max_concurrent_fetches: self.max_concurrent_fetches.unwrap_or(defaults.max_concurrent_fetches),
            max_concurrent_indexing: self.max_concurrent_indexing.unwrap_or(defaults.max_concurrent_indexing),
            num_parser_workers: self.num_parser_workers.unwrap_or(defaults.num_parser_workers),
            request_buffer_size: self.request_buffer_size.unwrap_or(defaults.request_buffer_size),
            max_file_size: self.max_file_size.unwrap_or(defaults.max_file_size),
            max_total_paths_length: self.max_total_paths_length.unwrap_or(defaults.max_total_paths_length),
        }
    }
}

#[derive(Parser, Debug)]
pub struct SearchCmdArgs {
    /// Repository name, e.g. github.com/acme/app
    pub repo: String,

    /// Commit to search at
    pub commit: String,

    /// Symbol name pattern (substring, or regex with --regex)
    #[arg(default_value = "")]
    pub query: String,

    /// Treat the query as a regular expression
    #[arg(short, long)]
    pub regex: bool,

    /// Match case exactly (also enables the ^literal$ fast path)
    #[arg(short = 'c', long)]
    pub case_sensitive: bool,

    /// Path regex a result must match (repeatable, all must match)
    #[arg(short, long, action = clap::ArgAction::Append)]
    pub include: Vec<String>,

    /// Path regex that excludes a result
    #[arg(short = 'x', long, default_value = "")]
    pub exclude: String,

    /// Maximum number of results (0 = default of 100)
    #[arg(short = 'n', long, default_value = "0")]
    pub first: i32,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl SearchCmdArgs {
    pub fn to_search_args(&self) -> SearchArgs {
        SearchArgs {
            repo: self.repo.clone(),
            commit_id: self.commit.clone(),
            query: self.query.clone(),
            is_regexp: self.regex,
            is_case_sensitive: self.case_sensitive,
            include_patterns: self.include.clone(),
            exclude_pattern: self.exclude.clone(),
            first: self.first,
        }
    }
}

#[derive(Parser, Debug)]
pub struct IndexCmdArgs {
    /// Repository name
    pub repo: String,

    /// Commit to build the index for
    pub commit: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Parser, Debug)]
pub struct CacheInfoArgs {
    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Parser, Debug)]
pub struct SanityCheckArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}
