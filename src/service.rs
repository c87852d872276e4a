//! Wiring: builds every component from a config and exposes the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CachedFile, Store};
use crate::config::SymbolsConfig;
use crate::error::{Result, SymbolsError};
use crate::fetcher::RepositoryFetcher;
use crate::gitserver::GitserverClient;
use crate::janitor::CacheEvicter;
use crate::metrics::Metrics;
use crate::parser::{Parser, SymbolParser};
use crate::search::QueryPlan;
use crate::writer::DatabaseWriter;
use crate::{store, SearchArgs, Symbol, SCHEMA_VERSION};

/// Construct the searcher and its janitor. The caller decides where the
/// janitor runs (usually a background task with [`CacheEvicter::run`]).
pub fn setup(
    config: &SymbolsConfig,
    git: Arc<dyn GitserverClient>,
    symbol_parser: Arc<dyn SymbolParser>,
    metrics: Arc<Metrics>,
) -> Result<(Searcher, CacheEvicter)> {
    config.validate()?;

    let store = Arc::new(Store::new(config.cache_dir.clone(), config.processing_timeout(), metrics.clone()));
    let fetcher = RepositoryFetcher::new(git.clone(), config, metrics.clone());
    let parser = Arc::new(Parser::new(symbol_parser, fetcher, config, metrics.clone()));
    let writer = Arc::new(DatabaseWriter::new(store.clone(), git, parser, config, metrics.clone()));
    let evicter = CacheEvicter::new(store.clone(), config, metrics.clone());

    let searcher = Searcher {
        store,
        writer,
        request_timeout: config.request_timeout(),
        metrics,
    };
    Ok((searcher, evicter))
}

/// Request path: get-or-build the index for a commit, then query it.
#[derive(Clone)]
pub struct Searcher {
    store: Arc<Store>,
    writer: Arc<DatabaseWriter>,
    request_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Searcher {
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Cache key of the index serving `args`.
    pub fn cache_key(args: &SearchArgs) -> [String; 2] {
        [args.repo.clone(), format!("{}-{}", args.commit_id, SCHEMA_VERSION)]
    }

    /// Run a search, building the index first if needed. The whole call,
    /// including a build it waits on, is bounded by the request timeout.
    pub async fn search(&self, cancel: &CancellationToken, args: &SearchArgs) -> Result<Vec<Symbol>> {
        // Reject bad patterns before spending anything on a build.
        let plan = QueryPlan::new(args)?;

        let work = async {
            let file = self.index(cancel, args).await?;
            tokio::task::spawn_blocking(move || {
                let conn = store::open_read_only(file.path())?;
                plan.execute(&conn)
            })
            .await?
        };

        let symbols = tokio::time::timeout(self.request_timeout, work)
            .await
            .map_err(|_| SymbolsError::Timeout { after: self.request_timeout })??;
        debug!(repo = %args.repo, commit = %args.commit_id, results = symbols.len(), "Search complete");
        Ok(symbols)
    }

    /// Make sure the index for `args.repo` at `args.commit_id` exists and
    /// return it pinned.
    pub async fn index(&self, cancel: &CancellationToken, args: &SearchArgs) -> Result<CachedFile> {
        if args.repo.is_empty() || args.commit_id.is_empty() {
            return Err(SymbolsError::InvalidArgs("repo and commitID are required".to_string()));
        }
        let [repo, commit_key] = Self::cache_key(args);
        let writer = self.writer.clone();
        let build_args = args.clone();

        self.store
            .get_or_build(cancel, &[&repo, &commit_key], move |build_cancel, tmp| async move {
                writer.write_db_file(&build_cancel, &build_args, &tmp).await.map(|_| ())
            })
            .await
    }

    /// Cancel in-flight builds.
    pub fn shutdown(&self) {
        self.store.shutdown();
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
