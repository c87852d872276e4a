//! Content-addressed cache of index files.
//!
//! A key is a list of components. Each component is hashed into a path
//! segment; all but the last become directories and the last becomes the
//! file name: `<dir>/<h(repo)>/<h(commit-schema)>.db`.
//!
//! Concurrency contract:
//! - At most one build per key is in flight. Later callers join the running
//!   build through a shared future and receive its result.
//! - A build runs in its own task under the store's background token and
//!   timeout. Waiters that give up do not stop it.
//! - Builds write to a `.build-*.tmp` file next to the target and are renamed
//!   into place on success, so a published file is always complete.
//! - Eviction never deletes a file that is pinned or whose key is building.
//!   The pin check and the delete happen under the pin lock.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use filetime::FileTime;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SymbolsError};
use crate::metrics::Metrics;

/// Extension of published index files.
pub const INDEX_EXTENSION: &str = "db";

/// Prefix of in-progress build files (and their SQLite journals).
pub const TEMP_PREFIX: &str = ".build-";

/// Attempts at resolving a key before giving up on a file that keeps
/// disappearing between publish and pin.
const MAX_ATTEMPTS: usize = 3;

type BuildResult = std::result::Result<PathBuf, Arc<SymbolsError>>;
type SharedBuild = Shared<BoxFuture<'static, BuildResult>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Deterministic, filesystem-safe encoding of one key component.
pub fn encode_key_component(component: &str) -> String {
    hex::encode(Sha256::digest(component.as_bytes()))
}

// ─── Pins ───────────────────────────────────────────────────────────

/// Reference-counted set of files that must not be evicted.
#[derive(Debug, Clone, Default)]
pub struct PinSet {
    inner: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl PinSet {
    pub fn pin(&self, path: &Path) -> PinGuard {
        *lock(&self.inner).entry(path.to_path_buf()).or_insert(0) += 1;
        PinGuard { pins: self.clone(), path: path.to_path_buf() }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        lock(&self.inner).contains_key(path)
    }
}

/// Unpins its path on drop.
#[derive(Debug)]
pub struct PinGuard {
    pins: PinSet,
    path: PathBuf,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = lock(&self.pins.inner);
        if let Some(count) = pins.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.path);
            }
        }
    }
}

/// A published index file, pinned for as long as this value lives.
#[derive(Debug)]
pub struct CachedFile {
    path: PathBuf,
    _pin: PinGuard,
}

impl CachedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ─── Cache entries ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(skip)]
    pub last_accessed: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionStats {
    pub size_before: u64,
    pub size_after: u64,
    pub evicted: usize,
    pub errors: usize,
}

// ─── Store ──────────────────────────────────────────────────────────

pub struct Store {
    dir: PathBuf,
    background_timeout: Duration,
    inflight: Mutex<HashMap<PathBuf, SharedBuild>>,
    pins: PinSet,
    background: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Store {
    pub fn new(dir: PathBuf, background_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            dir,
            background_timeout,
            inflight: Mutex::new(HashMap::new()),
            pins: PinSet::default(),
            background: CancellationToken::new(),
            metrics,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pins(&self) -> &PinSet {
        &self.pins
    }

    /// Path a key resolves to. Pure function of the key and the cache dir.
    pub fn path_for(&self, key: &[&str]) -> PathBuf {
        let mut path = self.dir.clone();
        for component in key {
            path.push(encode_key_component(component));
        }
        path.set_extension(INDEX_EXTENSION);
        path
    }

    /// Directory holding every file whose key starts with `prefix`.
    pub fn dir_for(&self, prefix: &str) -> PathBuf {
        self.dir.join(encode_key_component(prefix))
    }

    /// Cancel every running build. Used on shutdown.
    pub fn shutdown(&self) {
        self.background.cancel();
    }

    /// True while a build for `path` is running or the file is pinned.
    pub fn is_busy(&self, path: &Path) -> bool {
        lock(&self.inflight).contains_key(path) || self.pins.is_pinned(path)
    }

    /// Return the file for `key`, building it first if it does not exist.
    ///
    /// `build` receives a cancellation token scoped to the build (not to this
    /// caller) and the temporary path it must write the index to.
    pub async fn get_or_build<F, Fut>(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        key: &[&str],
        build: F,
    ) -> Result<CachedFile>
    where
        F: FnOnce(CancellationToken, PathBuf) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let path = self.path_for(key);
        let key_desc = key.join("/");

        for _ in 0..MAX_ATTEMPTS {
            let shared = {
                let mut inflight = lock(&self.inflight);
                if let Some(file) = self.try_hit(&path) {
                    self.metrics.cache_hits.inc();
                    debug!(key = %key_desc, "Cache hit");
                    return Ok(file);
                }
                self.metrics.cache_misses.inc();
                match inflight.get(&path) {
                    Some(running) => {
                        debug!(key = %key_desc, "Joining in-flight build");
                        running.clone()
                    }
                    None => {
                        info!(key = %key_desc, "Cache miss, building");
                        let fut = self.spawn_build(key_desc.clone(), path.clone(), build.clone());
                        inflight.insert(path.clone(), fut.clone());
                        fut
                    }
                }
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SymbolsError::Cancelled),
                result = shared => result,
            };
            let built = result.map_err(|e| shared_error(&key_desc, &e))?;
            if let Some(file) = self.try_hit(&built) {
                return Ok(file);
            }
            warn!(key = %key_desc, "Built file vanished before it could be pinned, retrying");
        }

        Err(SymbolsError::BuildFailed {
            key: key_desc,
            message: "index file was removed repeatedly right after being built".to_string(),
        })
    }

    /// Pin `path` and refresh its access time. `None` if the file is gone.
    fn try_hit(&self, path: &Path) -> Option<CachedFile> {
        let pin = self.pins.pin(path);
        filetime::set_file_mtime(path, FileTime::now())
            .ok()
            .map(|()| CachedFile { path: path.to_path_buf(), _pin: pin })
    }

    fn spawn_build<F, Fut>(self: &Arc<Self>, key_desc: String, path: PathBuf, build: F) -> SharedBuild
    where
        F: FnOnce(CancellationToken, PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let result = store.run_build(&key_desc, &path, build).await;
            if result.is_err() {
                store.metrics.build_failures.inc();
            }
            lock(&store.inflight).remove(&path);
            result.map_err(Arc::new)
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(SymbolsError::from(e))),
            }
        }
        .boxed()
        .shared()
    }

    async fn run_build<F, Fut>(&self, key_desc: &str, path: &Path, build: F) -> Result<PathBuf>
    where
        F: FnOnce(CancellationToken, PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let parent = path
            .parent()
            .ok_or_else(|| SymbolsError::InvalidConfig(format!("cache path has no parent: {}", path.display())))?;
        std::fs::create_dir_all(parent)?;

        // Removed on drop unless persisted.
        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(parent)?
            .into_temp_path();

        let cancel = self.background.child_token();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.background_timeout, build(cancel.clone(), tmp.to_path_buf())).await;

        match outcome {
            Err(_) => {
                cancel.cancel();
                warn!(key = %key_desc, timeout_secs = self.background_timeout.as_secs(), "Build timed out, abandoning");
                return Err(SymbolsError::Timeout { after: self.background_timeout });
            }
            Ok(Err(e)) => {
                warn!(key = %key_desc, error = %e, "Build failed");
                return Err(e);
            }
            Ok(Ok(())) => {}
        }

        tmp.persist(path).map_err(|e| SymbolsError::Io(e.error))?;
        info!(
            key = %key_desc,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Published index file"
        );
        Ok(path.to_path_buf())
    }

    // ─── Enumeration and eviction ───────────────────────────────────

    /// Published index files under `dir`, one level deep.
    pub fn entries_in(dir: &Path) -> Result<Vec<CacheEntry>> {
        let read_dir = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INDEX_EXTENSION) {
                continue;
            }
            // Raced with an eviction or a rename.
            let Ok(meta) = item.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            entries.push(CacheEntry {
                path,
                size_bytes: meta.len(),
                last_accessed: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    /// Every published index file in the cache.
    pub fn list_entries(&self) -> Result<Vec<CacheEntry>> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            if item.file_type()?.is_dir() {
                entries.extend(Self::entries_in(&item.path())?);
            }
        }
        Ok(entries)
    }

    /// Delete least recently accessed files until the cache fits in
    /// `max_bytes`. Busy files are skipped. Per-file failures are counted and
    /// do not stop the pass.
    pub fn evict(&self, max_bytes: u64) -> Result<EvictionStats> {
        let mut entries = self.list_entries()?;
        let size_before: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let mut stats = EvictionStats { size_before, size_after: size_before, ..Default::default() };
        if size_before <= max_bytes {
            return Ok(stats);
        }

        entries.sort_by_key(|e| e.last_accessed);
        for entry in entries {
            if stats.size_after <= max_bytes {
                break;
            }
            match self.remove_if_idle(&entry.path) {
                Ok(true) => {
                    stats.size_after = stats.size_after.saturating_sub(entry.size_bytes);
                    stats.evicted += 1;
                    debug!(path = %entry.path.display(), size = entry.size_bytes, "Evicted index file");
                }
                Ok(false) => {
                    debug!(path = %entry.path.display(), "Skipping busy index file");
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!(path = %entry.path.display(), error = %e, "Failed to evict index file");
                }
            }
        }
        Ok(stats)
    }

    fn remove_if_idle(&self, path: &Path) -> std::io::Result<bool> {
        let inflight = lock(&self.inflight);
        let pins = lock(&self.pins.inner);
        if inflight.contains_key(path) || pins.contains_key(path) {
            return Ok(false);
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Remove build leftovers (temp files and their journals) older than
    /// `max_age`. Returns the number of files removed.
    pub fn remove_stale_temp_files(&self, max_age: Duration) -> Result<usize> {
        let Ok(read_dir) = std::fs::read_dir(&self.dir) else { return Ok(0) };
        let now = SystemTime::now();
        let mut removed = 0;
        for repo_dir in read_dir.flatten() {
            let Ok(files) = std::fs::read_dir(repo_dir.path()) else { continue };
            for file in files.flatten() {
                let is_temp = file.file_name().to_str().is_some_and(|n| n.starts_with(TEMP_PREFIX));
                if !is_temp {
                    continue;
                }
                let age = file
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| now.duration_since(t).ok());
                if age.is_some_and(|age| age > max_age) {
                    match std::fs::remove_file(file.path()) {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = %file.path().display(), error = %e, "Failed to remove stale temp file"),
                    }
                }
            }
        }
        Ok(removed)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// Per-waiter view of a shared build failure.
fn shared_error(key: &str, err: &SymbolsError) -> SymbolsError {
    match err {
        SymbolsError::Timeout { after } => SymbolsError::Timeout { after: *after },
        SymbolsError::Cancelled => SymbolsError::Cancelled,
        SymbolsError::Upstream { repo, commit, message } => SymbolsError::Upstream {
            repo: repo.clone(),
            commit: commit.clone(),
            message: message.clone(),
        },
        other => SymbolsError::BuildFailed { key: key.to_string(), message: other.to_string() },
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
