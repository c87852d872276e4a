//! `serve`: JSON-lines request loop over stdio with the janitor in the background.
//!
//! Every request runs in its own task, so responses can arrive out of order;
//! a request's `id` (any JSON value) is echoed in its response.

use std::io::{self, BufRead, Write};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use symbols::{SearchArgs, Searcher, Symbol, SymbolsError};

use super::args::ServeArgs;
use super::{build_service, init_logging, runtime};

/// One response line. Exactly one of `symbols` and `error` is set.
#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<Symbol>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl Response {
    fn ok(id: Option<Value>, symbols: Vec<Symbol>) -> Self {
        Self { id, symbols: Some(symbols), error: None, retryable: false }
    }

    fn err(id: Option<Value>, e: &SymbolsError) -> Self {
        Self { id, symbols: None, error: Some(e.to_string()), retryable: e.is_retryable() }
    }
}

pub fn cmd_serve(args: ServeArgs) -> Result<(), SymbolsError> {
    init_logging(&args.common);
    let (config, searcher, evicter) = build_service(&args.common)?;
    info!(
        cache_dir = %config.cache_dir.display(),
        cache_size_mb = config.cache_size_mb,
        "Starting symbols server"
    );

    let root = CancellationToken::new();
    {
        let root = root.clone();
        let searcher = searcher.clone();
        ctrlc::set_handler(move || {
            info!("Interrupt received, shutting down");
            root.cancel();
            searcher.shutdown();
        })
        .map_err(|e| SymbolsError::InvalidConfig(format!("cannot install Ctrl-C handler: {}", e)))?;
    }

    // stdin is read on a plain thread; the runtime only sees complete lines.
    let (line_tx, line_rx) = mpsc::channel::<String>(64);
    std::thread::Builder::new()
        .name("symbols-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if line_tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error reading stdin");
                        break;
                    }
                }
            }
        })?;

    let rt = runtime()?;
    rt.block_on(async {
        let janitor = {
            let root = root.clone();
            tokio::spawn(async move { evicter.run(&root).await })
        };

        let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(64);
        let stdout_writer = tokio::task::spawn_blocking(move || {
            while let Some(response) = resp_rx.blocking_recv() {
                write_response(&response);
            }
        });

        info!("Server ready, waiting for JSON requests on stdin");
        serve_requests(&searcher, &root, line_rx, resp_tx).await;

        root.cancel();
        searcher.shutdown();
        if let Err(e) = stdout_writer.await {
            warn!(error = %e, "Response writer failed");
        }
        if let Err(e) = janitor.await {
            warn!(error = %e, "Janitor task failed");
        }
    });
    Ok(())
}

/// Spawn a task per request line until the input ends or `root` fires, then
/// wait for the requests still running. Responses go to `responses` in
/// completion order.
pub(crate) async fn serve_requests(
    searcher: &Searcher,
    root: &CancellationToken,
    mut lines: mpsc::Receiver<String>,
    responses: mpsc::Sender<Response>,
) {
    let mut requests = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = root.cancelled() => break,
            Some(done) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = done {
                    error!(error = %e, "Request task failed");
                }
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    info!("stdin closed, shutting down");
                    break;
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let (searcher, cancel, responses) = (searcher.clone(), root.child_token(), responses.clone());
                requests.spawn(async move {
                    let response = handle_line(&searcher, &cancel, &line).await;
                    let _ = responses.send(response).await;
                });
            }
        }
    }

    while let Some(done) = requests.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "Request task failed");
        }
    }
}

/// Request `id` (if any) and the search arguments of one input line.
fn parse_request(line: &str) -> (Option<Value>, Result<SearchArgs, SymbolsError>) {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return (None, Err(e.into())),
    };
    let id = value.get("id").cloned();
    (id, serde_json::from_value(value).map_err(SymbolsError::from))
}

async fn handle_line(searcher: &Searcher, cancel: &CancellationToken, line: &str) -> Response {
    debug!(request = %line, "Incoming request");
    let (id, args) = parse_request(line);
    let args = match args {
        Ok(args) => args,
        Err(e) => {
            warn!(error = %e, "Failed to parse request");
            return Response::err(id, &e);
        }
    };
    match searcher.search(cancel, &args).await {
        Ok(symbols) => Response::ok(id, symbols),
        Err(e) => {
            warn!(repo = %args.repo, commit = %args.commit_id, error = %e, "Search failed");
            Response::err(id, &e)
        }
    }
}

fn write_response(response: &Response) {
    let line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            return;
        }
    };
    let mut out = io::stdout().lock();
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

#[cfg(test)]
#[path = "serve_tests.rs"]
mod tests;
