//! Symbol extraction: the [`SymbolParser`] contract and the [`Parser`]
//! pipeline that runs it over a fetched archive.

pub mod treesitter;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SymbolsConfig;
use crate::error::{Result, SymbolsError};
use crate::fetcher::RepositoryFetcher;
use crate::metrics::Metrics;
use crate::{ParseRequest, Symbol};

pub use treesitter::TreeSitterParser;

/// Turns the bytes of one file into its symbols.
///
/// Implementations are called from many blocking threads at once.
pub trait SymbolParser: Send + Sync {
    fn parse(&self, path: &str, data: &[u8]) -> Result<Vec<Symbol>>;
}

/// Fetches an archive and parses every eligible file on a bounded pool of
/// blocking workers.
pub struct Parser {
    symbol_parser: Arc<dyn SymbolParser>,
    fetcher: RepositoryFetcher,
    num_workers: usize,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl Parser {
    pub fn new(
        symbol_parser: Arc<dyn SymbolParser>,
        fetcher: RepositoryFetcher,
        config: &SymbolsConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            symbol_parser,
            fetcher,
            num_workers: config.num_parser_workers.max(1),
            buffer: config.request_buffer_size.max(1),
            metrics,
        }
    }

    pub fn fetcher(&self) -> &RepositoryFetcher {
        &self.fetcher
    }

    /// Symbols of `commit`, restricted to `paths` when non-empty.
    ///
    /// Files that fail to parse are logged and skipped. A fetch failure or
    /// cancellation arrives as a final `Err` item.
    pub fn parse(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        commit: &str,
        paths: Vec<String>,
    ) -> mpsc::Receiver<Result<Symbol>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let requests = self.fetcher.fetch_repository_archive(cancel, repo, commit, paths);
        let symbol_parser = self.symbol_parser.clone();
        let metrics = self.metrics.clone();
        let num_workers = self.num_workers;
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if let Err(e) = run_workers(requests, symbol_parser, metrics, num_workers, &cancel, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }
}

async fn run_workers(
    mut requests: mpsc::Receiver<Result<ParseRequest>>,
    symbol_parser: Arc<dyn SymbolParser>,
    metrics: Arc<Metrics>,
    num_workers: usize,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Result<Symbol>>,
) -> Result<()> {
    let slots = Arc::new(Semaphore::new(num_workers));
    let mut workers = JoinSet::new();
    let mut files = 0usize;

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SymbolsError::Cancelled),
            _ = tx.closed() => None,
            item = requests.recv() => item,
        };
        let request = match item {
            Some(Ok(request)) => request,
            Some(Err(e)) => return Err(e),
            None => break,
        };
        if tx.is_closed() {
            break;
        }

        let permit = slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SymbolsError::Cancelled)?;
        let (parser, worker_metrics, tx) = (symbol_parser.clone(), metrics.clone(), tx.clone());
        files += 1;

        workers.spawn_blocking(move || {
            let _permit = permit;
            for symbol in parse_file(parser.as_ref(), &worker_metrics, request) {
                if tx.blocking_send(Ok(symbol)).is_err() {
                    break;
                }
            }
        });

        while let Some(res) = workers.try_join_next() {
            log_worker_failure(res, &metrics);
        }
    }

    while let Some(res) = workers.join_next().await {
        log_worker_failure(res, &metrics);
    }
    if cancel.is_cancelled() {
        return Err(SymbolsError::Cancelled);
    }
    if tx.is_closed() {
        debug!(files, "Consumer gone, stopped parsing early");
        return Ok(());
    }
    debug!(files, "Parsed archive");
    Ok(())
}

fn log_worker_failure(res: std::result::Result<(), tokio::task::JoinError>, metrics: &Metrics) {
    if let Err(e) = res {
        metrics.parse_errors.inc();
        warn!(error = %e, "Parser worker panicked");
    }
}

/// Parse one file. Symbols always carry the request path and are unique
/// within the file.
fn parse_file(parser: &dyn SymbolParser, metrics: &Metrics, request: ParseRequest) -> Vec<Symbol> {
    match parser.parse(&request.path, &request.data) {
        Ok(symbols) => {
            let mut seen = HashSet::new();
            symbols
                .into_iter()
                .map(|mut symbol| {
                    if symbol.path != request.path {
                        symbol.path.clone_from(&request.path);
                    }
                    symbol
                })
                .filter(|symbol| seen.insert(symbol.clone()))
                .collect()
        }
        Err(e) => {
            metrics.parse_errors.inc();
            warn!(path = %request.path, error = %e, "Failed to parse file, skipping");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, MockGitserverClient, MockParser};

    struct DuplicatingParser;

    impl SymbolParser for DuplicatingParser {
        fn parse(&self, _path: &str, _data: &[u8]) -> Result<Vec<Symbol>> {
            let symbol = Symbol {
                name: "Dup".to_string(),
                path: "somewhere/else.go".to_string(),
                line: 1,
                kind: "function".to_string(),
                parent: String::new(),
            };
            Ok(vec![symbol.clone(), symbol])
        }
    }

    fn pipeline(client: Arc<MockGitserverClient>, symbol_parser: Arc<dyn SymbolParser>) -> (Parser, Arc<Metrics>) {
        let config = test_config(&std::env::temp_dir());
        let metrics = Arc::new(Metrics::new());
        let fetcher = RepositoryFetcher::new(client, &config, metrics.clone());
        (Parser::new(symbol_parser, fetcher, &config, metrics.clone()), metrics)
    }

    async fn drain(mut rx: mpsc::Receiver<Result<Symbol>>) -> Result<Vec<Symbol>> {
        let mut symbols = Vec::new();
        while let Some(item) = rx.recv().await {
            symbols.push(item?);
        }
        symbols.sort();
        Ok(symbols)
    }

    #[tokio::test]
    async fn test_parse_whole_tree() {
        let client = Arc::new(MockGitserverClient::new());
        let files: Vec<(String, String)> = (0..20)
            .map(|i| (format!("pkg/f{}.go", i), format!("func F{}() {{}}\nvar V{}\n", i, i)))
            .collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(p, d)| (p.as_str(), d.as_str())).collect();
        client.add_commit("repo", "c1", &refs);
        let (parser, _) = pipeline(client, Arc::new(MockParser::new()));

        let symbols = drain(parser.parse(&CancellationToken::new(), "repo", "c1", Vec::new()))
            .await
            .unwrap();
        assert_eq!(symbols.len(), 40);
        assert!(symbols.iter().any(|s| s.name == "F7" && s.path == "pkg/f7.go" && s.line == 1));
        assert!(symbols.iter().any(|s| s.name == "V7" && s.kind == "variable" && s.line == 2));
    }

    #[tokio::test]
    async fn test_parse_error_skips_file_and_counts() {
        let client = Arc::new(MockGitserverClient::new());
        client.add_commit("repo", "c1", &[("bad.go", "PARSE_ERROR\nfunc Bad"), ("good.go", "func Good")]);
        let (parser, metrics) = pipeline(client, Arc::new(MockParser::new()));

        let symbols = drain(parser.parse(&CancellationToken::new(), "repo", "c1", Vec::new()))
            .await
            .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "Good");
        assert_eq!(metrics.parse_errors.get(), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_is_terminal() {
        let client = Arc::new(MockGitserverClient::new());
        client.fail_fetches(Some("boom"));
        let (parser, _) = pipeline(client, Arc::new(MockParser::new()));

        let err = drain(parser.parse(&CancellationToken::new(), "repo", "c1", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SymbolsError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_symbols_take_request_path_and_are_deduplicated() {
        let client = Arc::new(MockGitserverClient::new());
        client.add_commit("repo", "c1", &[("a.go", "x")]);
        let (parser, _) = pipeline(client, Arc::new(DuplicatingParser));

        let symbols = drain(parser.parse(&CancellationToken::new(), "repo", "c1", Vec::new()))
            .await
            .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].path, "a.go");
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_parsing() {
        let client = Arc::new(MockGitserverClient::new());
        let files: Vec<(String, String)> = (0..500).map(|i| (format!("f{}.go", i), format!("func F{}", i))).collect();
        let refs: Vec<(&str, &str)> = files.iter().map(|(p, d)| (p.as_str(), d.as_str())).collect();
        client.add_commit("repo", "c1", &refs);
        let symbol_parser = Arc::new(MockParser::new());
        let (parser, _) = pipeline(client, symbol_parser.clone());

        let mut rx = parser.parse(&CancellationToken::new(), "repo", "c1", Vec::new());
        assert!(rx.recv().await.unwrap().is_ok());
        drop(rx);

        // Wait for the pipeline to settle.
        let mut last = usize::MAX;
        for _ in 0..40 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let calls = symbol_parser.calls();
            if calls == last {
                break;
            }
            last = calls;
        }
        assert!(symbol_parser.calls() < 100, "parsed {} files after the consumer left", symbol_parser.calls());
    }

    #[tokio::test]
    async fn test_cancelled_parse_reports_cancellation() {
        let client = Arc::new(MockGitserverClient::new());
        client.add_commit("repo", "c1", &[("a.go", "func A")]);
        let (parser, _) = pipeline(client, Arc::new(MockParser::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = drain(parser.parse(&cancel, "repo", "c1", Vec::new())).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
