//! Archive fetcher: turns a repository tree archive into a stream of
//! [`ParseRequest`]s.
//!
//! Fetches are bounded by a global semaphore. The archive is consumed entry by
//! entry on a blocking thread and each eligible file is handed to the consumer
//! through a bounded channel, so peak memory is one file plus the channel.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SymbolsConfig;
use crate::error::{Result, SymbolsError};
use crate::gitserver::GitserverClient;
use crate::metrics::Metrics;
use crate::ParseRequest;

/// Extensions of files that never contain symbols.
pub const SKIPPED_EXTENSIONS: &[&str] = &["json"];

/// Bytes inspected for a NUL when guessing whether a file is binary.
pub const BINARY_SNIFF_LEN: usize = 256;

#[derive(Clone)]
pub struct RepositoryFetcher {
    client: Arc<dyn GitserverClient>,
    fetch_sem: Arc<Semaphore>,
    max_file_size: u64,
    request_buffer_size: usize,
    metrics: Arc<Metrics>,
}

impl RepositoryFetcher {
    pub fn new(client: Arc<dyn GitserverClient>, config: &SymbolsConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            fetch_sem: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
            max_file_size: config.max_file_size,
            request_buffer_size: config.request_buffer_size.max(1),
            metrics,
        }
    }

    pub fn client(&self) -> &Arc<dyn GitserverClient> {
        &self.client
    }

    /// Stream parse requests for `commit`, restricted to `paths` when non-empty.
    ///
    /// The receiver yields requests in archive order. If the archive cannot be
    /// fetched or read, the last item is an `Err` and nothing follows it.
    pub fn fetch_repository_archive(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        commit: &str,
        paths: Vec<String>,
    ) -> mpsc::Receiver<Result<ParseRequest>> {
        let (tx, rx) = mpsc::channel(self.request_buffer_size);
        let this = self.clone();
        let cancel = cancel.clone();
        let (repo, commit) = (repo.to_string(), commit.to_string());

        tokio::spawn(async move {
            if let Err(e) = this.fetch(&cancel, &repo, &commit, &paths, &tx).await {
                if !e.is_cancelled() {
                    this.metrics.fetch_failed.inc();
                    warn!(repo = %repo, commit = %commit, error = %e, "Archive fetch failed");
                }
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        commit: &str,
        paths: &[String],
        tx: &mpsc::Sender<Result<ParseRequest>>,
    ) -> Result<()> {
        // Held until the whole archive has been read, not just until the
        // request returns.
        let _permit = self.limit_concurrent_fetches(cancel).await?;
        let _fetching = self.metrics.fetching.track();

        debug!(repo = %repo, commit = %commit, num_paths = paths.len(), "Fetching archive");
        let reader = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SymbolsError::Cancelled),
            res = self.client.fetch_tar(repo, commit, paths) => res?,
        };

        let tx = tx.clone();
        let cancel = cancel.clone();
        let max_file_size = self.max_file_size;
        let (repo, commit) = (repo.to_string(), commit.to_string());

        tokio::task::spawn_blocking(move || {
            read_tar(reader, max_file_size, &cancel, |request| tx.blocking_send(Ok(request)).is_ok()).map_err(
                |e| match e {
                    SymbolsError::Io(io) => SymbolsError::Archive { repo, commit, message: io.to_string() },
                    other => other,
                },
            )
        })
        .await?
    }

    async fn limit_concurrent_fetches(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        self.metrics.fetch_queue_size.inc();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SymbolsError::Cancelled),
            permit = self.fetch_sem.clone().acquire_owned() => {
                permit.map_err(|_| SymbolsError::Cancelled)
            }
        };
        self.metrics.fetch_queue_size.dec();
        permit
    }
}

// ─── Tar reading ─────────────────────────────────────────────────────

/// Whether an archive entry is worth parsing, judged from its header alone.
pub fn should_parse(is_regular_file: bool, size: u64, path: &str, max_file_size: u64) -> bool {
    if size > max_file_size {
        return false;
    }
    if !is_regular_file {
        return false;
    }
    let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("");
    !SKIPPED_EXTENSIONS.contains(&ext)
}

/// Read a tar stream and call `emit` for every eligible file.
///
/// Stops early without error when `emit` returns false (the consumer is gone).
pub fn read_tar<R: Read>(
    reader: R,
    max_file_size: u64,
    cancel: &CancellationToken,
    mut emit: impl FnMut(ParseRequest) -> bool,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(SymbolsError::Cancelled);
        }
        let mut entry = entry?;
        let size = entry.size();
        let path = entry.path()?.to_string_lossy().into_owned();

        if !should_parse(entry.header().entry_type().is_file(), size, &path, max_file_size) {
            continue;
        }
        if size == 0 {
            continue;
        }

        let size = size as usize;
        let sniff_len = size.min(BINARY_SNIFF_LEN);
        let mut data = vec![0u8; size];
        entry.read_exact(&mut data[..sniff_len])?;
        if data[..sniff_len].contains(&0) {
            continue;
        }
        entry.read_exact(&mut data[sniff_len..])?;

        if !emit(ParseRequest { path, data }) {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "fetcher_tests.rs"]
mod tests;
