//! Index writer: builds the index file for one (repository, commit).
//!
//! When the cache already holds an index for the same repository at another
//! commit, the newest one is copied and patched with the diff between the two
//! commits. Anything that makes that impossible (no base, unreadable base,
//! diff over the path budget) falls back to a full build. Both strategies
//! write all rows in a single transaction.
//!
//! At most `max_concurrent_indexing` builds run at once; the rest wait for a
//! slot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{PinGuard, Store};
use crate::config::SymbolsConfig;
use crate::error::{Result, SymbolsError};
use crate::gitserver::GitserverClient;
use crate::metrics::Metrics;
use crate::parser::Parser;
use crate::{store, Changes, SearchArgs, Symbol, SCHEMA_VERSION};

/// How an index file was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildKind {
    Full { symbols: u64 },
    Incremental { base_commit: String, changed_paths: usize, symbols: u64 },
}

impl BuildKind {
    pub fn symbols(&self) -> u64 {
        match self {
            BuildKind::Full { symbols } | BuildKind::Incremental { symbols, .. } => *symbols,
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, BuildKind::Incremental { .. })
    }
}

/// A candidate incremental base, pinned against eviction while held.
struct Base {
    path: PathBuf,
    commit: String,
    _pin: PinGuard,
}

pub struct DatabaseWriter {
    store: Arc<Store>,
    git: Arc<dyn GitserverClient>,
    parser: Arc<Parser>,
    metrics: Arc<Metrics>,
    indexing_sem: Arc<Semaphore>,
    max_total_paths_length: usize,
}

impl DatabaseWriter {
    pub fn new(
        store: Arc<Store>,
        git: Arc<dyn GitserverClient>,
        parser: Arc<Parser>,
        config: &SymbolsConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            git,
            parser,
            metrics,
            indexing_sem: Arc::new(Semaphore::new(config.max_concurrent_indexing)),
            max_total_paths_length: config.max_total_paths_length,
        }
    }

    /// Write the index for `args.repo` at `args.commit_id` into `db_file`.
    ///
    /// `db_file` is owned by the caller and is never published by this
    /// function; on error its contents are unspecified.
    pub async fn write_db_file(
        &self,
        cancel: &CancellationToken,
        args: &SearchArgs,
        db_file: &Path,
    ) -> Result<BuildKind> {
        let _slot = self.limit_concurrent_indexing(cancel).await?;
        let _indexing = self.metrics.indexing.track();
        let started = Instant::now();
        self.metrics.builds.inc();

        let kind = match self.find_base(&args.repo, db_file).await {
            Some(base) => match self.write_incrementally(cancel, args, db_file, base).await? {
                Some(kind) => kind,
                None => self.write_full(cancel, args, db_file).await?,
            },
            None => self.write_full(cancel, args, db_file).await?,
        };

        info!(
            repo = %args.repo,
            commit = %args.commit_id,
            incremental = kind.is_incremental(),
            symbols = kind.symbols(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built index"
        );
        Ok(kind)
    }

    async fn limit_concurrent_indexing(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        self.metrics.indexing_queue_size.inc();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SymbolsError::Cancelled),
            permit = self.indexing_sem.clone().acquire_owned() => {
                permit.map_err(|_| SymbolsError::Cancelled)
            }
        };
        self.metrics.indexing_queue_size.dec();
        permit
    }

    /// Newest readable index of the same repository, if any.
    async fn find_base(&self, repo: &str, db_file: &Path) -> Option<Base> {
        let entries = match Store::entries_in(&self.store.dir_for(repo)) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(repo = %repo, error = %e, "Failed to list cached indexes, doing a full build");
                return None;
            }
        };
        let newest = entries
            .into_iter()
            .filter(|e| e.path != db_file)
            .max_by_key(|e| e.last_accessed)?;

        let pin = self.store.pins().pin(&newest.path);
        let path = newest.path.clone();
        let read = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = store::open_read_only(&path)?;
            if store::get_schema_version(&conn)? != SCHEMA_VERSION {
                return Ok(None);
            }
            store::get_commit(&conn)
        })
        .await;

        match read {
            Ok(Ok(Some(commit))) => Some(Base { path: newest.path, commit, _pin: pin }),
            Ok(Ok(None)) => {
                debug!(path = %newest.path.display(), "Base index has no usable meta row");
                None
            }
            Ok(Err(e)) => {
                debug!(path = %newest.path.display(), error = %e, "Base index unreadable");
                None
            }
            Err(e) => {
                warn!(error = %e, "Reading base index panicked");
                None
            }
        }
    }

    /// `Ok(None)` means the incremental path was abandoned and a full build is
    /// needed.
    async fn write_incrementally(
        &self,
        cancel: &CancellationToken,
        args: &SearchArgs,
        db_file: &Path,
        base: Base,
    ) -> Result<Option<BuildKind>> {
        let changes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SymbolsError::Cancelled),
            changes = self.git.git_diff(&args.repo, &base.commit, &args.commit_id) => changes?,
        };

        let total = changes.total_paths_length();
        if total > self.max_total_paths_length {
            info!(
                repo = %args.repo,
                commit = %args.commit_id,
                base_commit = %base.commit,
                total_paths_length = total,
                budget = self.max_total_paths_length,
                "Diff too large for an incremental build, doing a full build"
            );
            return Ok(None);
        }

        info!(
            repo = %args.repo,
            commit = %args.commit_id,
            base_commit = %base.commit,
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "Building incrementally"
        );
        self.metrics.incremental_builds.inc();

        let (src, dst) = (base.path.clone(), db_file.to_path_buf());
        tokio::task::spawn_blocking(move || std::fs::copy(src, dst)).await??;
        let base_commit = base.commit.clone();
        drop(base);

        let symbols = self.parse_paths(cancel, args, &changes);
        let (db_file, commit) = (db_file.to_path_buf(), args.commit_id.clone());
        let changed_paths = changes.all_paths();
        let num_changed = changed_paths.len();

        let symbols = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut conn = store::open(&db_file)?;
            let tx = conn.transaction()?;
            store::delete_paths(&tx, &changed_paths)?;
            store::write_symbols(&tx, receiver_iter(symbols))?;
            store::update_meta(&tx, &commit)?;
            tx.commit()?;
            store::count_symbols(&conn)
        })
        .await??;

        Ok(Some(BuildKind::Incremental { base_commit, changed_paths: num_changed, symbols }))
    }

    async fn write_full(&self, cancel: &CancellationToken, args: &SearchArgs, db_file: &Path) -> Result<BuildKind> {
        info!(repo = %args.repo, commit = %args.commit_id, "Building from scratch");
        let symbols = self.parser.parse(cancel, &args.repo, &args.commit_id, Vec::new());
        let (db_file, commit) = (db_file.to_path_buf(), args.commit_id.clone());

        let symbols = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut conn = store::open(&db_file)?;
            store::set_schema_version(&conn, SCHEMA_VERSION)?;
            let tx = conn.transaction()?;
            store::create_meta_table(&tx)?;
            store::create_symbols_table(&tx)?;
            store::insert_meta(&tx, &commit)?;
            let written = store::write_symbols(&tx, receiver_iter(symbols))?;
            store::create_symbol_indexes(&tx)?;
            tx.commit()?;
            Ok(written as u64)
        })
        .await??;

        Ok(BuildKind::Full { symbols })
    }

    /// Symbols of the added and modified paths. Deletions need no fetch.
    fn parse_paths(
        &self,
        cancel: &CancellationToken,
        args: &SearchArgs,
        changes: &Changes,
    ) -> mpsc::Receiver<Result<Symbol>> {
        let paths = changes.paths_to_fetch();
        if paths.is_empty() {
            let (_, rx) = mpsc::channel(1);
            return rx;
        }
        self.parser.parse(cancel, &args.repo, &args.commit_id, paths)
    }
}

/// Drain a symbol channel from a blocking thread.
fn receiver_iter(mut rx: mpsc::Receiver<Result<Symbol>>) -> impl Iterator<Item = Result<Symbol>> {
    std::iter::from_fn(move || rx.blocking_recv())
}

#[cfg(test)]
#[path = "writer_tests.rs"]
mod tests;
