//! CLI layer: argument parsing, command dispatch, and subcommand implementations.

pub mod args;
mod serve;

pub use args::*;

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use symbols::cache::Store;
use symbols::gitserver::local::LocalGitClient;
use symbols::parser::TreeSitterParser;
use symbols::{setup, store, Metrics, SearchArgs, Searcher, Symbol, SymbolsConfig, SymbolsError};
use symbols::janitor::CacheEvicter;

// ─── CLI ─────────────────────────────────────────────────────────────

/// Per-commit symbol index: builds, caches and searches code symbols
#[derive(Parser, Debug)]
#[command(name = "symbols", version, long_version = long_version(), about, after_help = "\
Run 'symbols <COMMAND> --help' for detailed options and examples.\n\
Every setting also reads a SYMBOLS_* environment variable, e.g. SYMBOLS_CACHE_DIR.")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Search symbols in a repository at a commit (builds the index if needed)
    Search(SearchCmdArgs),

    /// Build the index for a commit without searching it
    Index(IndexCmdArgs),

    /// Answer JSON-lines search requests on stdin, one JSON response per line on stdout
    Serve(ServeArgs),

    /// List cached index files with size and last access
    CacheInfo(CacheInfoArgs),

    /// Verify that SQLite and the cache directory work
    SanityCheck(SanityCheckArgs),
}

fn long_version() -> &'static str {
    concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_DATETIME"), ")")
}

// ─── Main entry point ───────────────────────────────────────────────

pub fn run() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Search(args) => cmd_search(args),
        Commands::Index(args) => cmd_index(args),
        Commands::Serve(args) => serve::cmd_serve(args),
        Commands::CacheInfo(args) => cmd_cache_info(args),
        Commands::SanityCheck(args) => cmd_sanity_check(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ─── Shared setup ───────────────────────────────────────────────────

pub(crate) fn init_logging(common: &CommonArgs) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&common.log_level));
    match common.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, SymbolsError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("symbols-worker")
        .build()?)
}

/// The service wired to local git repositories and the tree-sitter parser.
pub(crate) fn build_service(common: &CommonArgs) -> Result<(SymbolsConfig, Searcher, CacheEvicter), SymbolsError> {
    let config = common.to_config();
    let git = Arc::new(LocalGitClient::new(common.repos_root.clone()));
    let (searcher, evicter) = setup(&config, git, Arc::new(TreeSitterParser::new()), Arc::new(Metrics::new()))?;
    Ok((config, searcher, evicter))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), SymbolsError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ─── search / index ─────────────────────────────────────────────────

fn cmd_search(args: SearchCmdArgs) -> Result<(), SymbolsError> {
    init_logging(&args.common);
    let (_, searcher, _) = build_service(&args.common)?;
    let request = args.to_search_args();

    let start = Instant::now();
    let symbols: Vec<Symbol> = runtime()?.block_on(searcher.search(&CancellationToken::new(), &request))?;
    info!(
        repo = %request.repo,
        commit = %request.commit_id,
        results = symbols.len(),
        elapsed_ms = format_args!("{:.1}", start.elapsed().as_secs_f64() * 1000.0),
        "Search finished"
    );
    for sample in searcher.metrics().snapshot() {
        debug!(metric = sample.name, value = sample.value, "Metric");
    }
    print_json(&symbols)
}

fn cmd_index(args: IndexCmdArgs) -> Result<(), SymbolsError> {
    init_logging(&args.common);
    let (_, searcher, _) = build_service(&args.common)?;
    let request = SearchArgs {
        repo: args.repo.clone(),
        commit_id: args.commit.clone(),
        ..Default::default()
    };

    let start = Instant::now();
    let file = runtime()?.block_on(searcher.index(&CancellationToken::new(), &request))?;
    let conn = store::open_read_only(file.path())?;
    let count = store::count_symbols(&conn)?;
    let size = std::fs::metadata(file.path()).map(|m| m.len()).unwrap_or(0);
    eprintln!(
        "Index for {}@{} at {} ({} symbols, {:.1} MB, {:.1}s)",
        args.repo,
        args.commit,
        file.path().display(),
        count,
        size as f64 / 1_048_576.0,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

// ─── cache-info ─────────────────────────────────────────────────────

fn cmd_cache_info(args: CacheInfoArgs) -> Result<(), SymbolsError> {
    init_logging(&args.common);
    let config = args.common.to_config();
    let mut entries = Store::entries_in(&config.cache_dir)?;
    entries.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    let now = SystemTime::now();
    let age_secs = |t: SystemTime| now.duration_since(t).map(|d| d.as_secs()).unwrap_or(0);

    if args.json {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "path": e.path.display().to_string(),
                    "sizeBytes": e.size_bytes,
                    "lastAccessedSecsAgo": age_secs(e.last_accessed),
                })
            })
            .collect();
        return print_json(&serde_json::json!({
            "cacheDir": config.cache_dir.display().to_string(),
            "totalBytes": total,
            "budgetBytes": config.cache_size_bytes(),
            "entries": items,
        }));
    }

    eprintln!("Cache directory: {}", config.cache_dir.display());
    if entries.is_empty() {
        eprintln!("No index files found.");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{:>10.1} MB  {:>8}s ago  {}",
            entry.size_bytes as f64 / 1_048_576.0,
            age_secs(entry.last_accessed),
            entry.path.display()
        );
    }
    eprintln!(
        "{} index file(s), {:.1} MB of {:.1} MB budget",
        entries.len(),
        total as f64 / 1_048_576.0,
        config.cache_size_bytes() as f64 / 1_048_576.0
    );
    Ok(())
}

// ─── sanity-check ───────────────────────────────────────────────────

/// Build and query a throwaway index inside the cache directory.
fn cmd_sanity_check(args: SanityCheckArgs) -> Result<(), SymbolsError> {
    init_logging(&args.common);
    let config = args.common.to_config();
    config.validate()?;
    std::fs::create_dir_all(&config.cache_dir)?;

    let scratch = tempfile::Builder::new().prefix(".sanity-").tempdir_in(&config.cache_dir)?;
    let db_file = scratch.path().join("check.db");
    let mut conn = store::open(&db_file)?;
    let tx = conn.transaction()?;
    store::create_meta_table(&tx)?;
    store::create_symbols_table(&tx)?;
    store::insert_meta(&tx, "sanity")?;
    let sample = Symbol {
        name: "SanityCheck".to_string(),
        path: "sanity.go".to_string(),
        line: 1,
        kind: "function".to_string(),
        parent: String::new(),
    };
    store::write_symbols(&tx, [Ok(sample.clone())])?;
    store::create_symbol_indexes(&tx)?;
    tx.commit()?;
    drop(conn);

    let request = SearchArgs {
        repo: "sanity".to_string(),
        commit_id: "sanity".to_string(),
        query: "^SanityCheck$".to_string(),
        is_regexp: true,
        is_case_sensitive: true,
        ..Default::default()
    };
    let found = symbols::search::search(&request, &db_file)?;
    if found != vec![sample] {
        return Err(SymbolsError::InvalidConfig(format!(
            "sanity index returned {} unexpected result(s)",
            found.len()
        )));
    }

    eprintln!("OK: SQLite {} works in {}", rusqlite::version(), config.cache_dir.display());
    Ok(())
}
