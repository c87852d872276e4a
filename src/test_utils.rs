//! Shared fakes for unit tests: an in-memory archive/diff source and a
//! line-based symbol parser.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::SymbolsConfig;
use crate::error::{Result, SymbolsError};
use crate::gitserver::{ArchiveReader, GitserverClient};
use crate::parser::SymbolParser;
use crate::{Changes, Symbol};

// ─── Tar helpers ────────────────────────────────────────────────────

/// Tar archive of regular files, in the given order.
pub fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Config rooted at `cache_dir` with small timeouts and pools.
pub fn test_config(cache_dir: &Path) -> SymbolsConfig {
    SymbolsConfig {
        cache_dir: cache_dir.to_path_buf(),
        cache_size_mb: 1_000,
        eviction_interval_secs: 1,
        processing_timeout_secs: 30,
        request_timeout_secs: 30,
        max_concurrent_fetches: 4,
        num_parser_workers: 2,
        request_buffer_size: 16,
        ..Default::default()
    }
}

// ─── MockGitserverClient ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub repo: String,
    pub commit: String,
    pub paths: Vec<String>,
}

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct MockState {
    trees: HashMap<(String, String), Tree>,
    diff_overrides: HashMap<(String, String, String), Changes>,
    fetch_calls: Vec<FetchCall>,
    diff_calls: Vec<(String, String, String)>,
    fetch_error: Option<String>,
    diff_error: Option<String>,
    fetch_delay: Option<Duration>,
}

/// Archive and diff source over in-memory trees.
///
/// Diffs are computed from the stored trees unless overridden with
/// [`MockGitserverClient::set_diff`].
#[derive(Default)]
pub struct MockGitserverClient {
    state: Mutex<MockState>,
}

impl MockGitserverClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_commit(&self, repo: &str, commit: &str, files: &[(&str, &str)]) {
        let tree = files
            .iter()
            .map(|(path, data)| (path.to_string(), data.as_bytes().to_vec()))
            .collect();
        self.add_tree(repo, commit, tree);
    }

    pub fn add_tree(&self, repo: &str, commit: &str, tree: Tree) {
        let mut state = self.state.lock().unwrap();
        state.trees.insert((repo.to_string(), commit.to_string()), tree);
    }

    pub fn set_diff(&self, repo: &str, from: &str, to: &str, changes: Changes) {
        let mut state = self.state.lock().unwrap();
        state
            .diff_overrides
            .insert((repo.to_string(), from.to_string(), to.to_string()), changes);
    }

    pub fn fail_fetches(&self, message: Option<&str>) {
        self.state.lock().unwrap().fetch_error = message.map(str::to_string);
    }

    pub fn fail_diffs(&self, message: Option<&str>) {
        self.state.lock().unwrap().diff_error = message.map(str::to_string);
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().fetch_delay = delay;
    }

    pub fn fetch_calls(&self) -> Vec<FetchCall> {
        self.state.lock().unwrap().fetch_calls.clone()
    }

    pub fn diff_calls(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().diff_calls.clone()
    }
}

fn upstream(repo: &str, commit: &str, message: &str) -> SymbolsError {
    SymbolsError::Upstream {
        repo: repo.to_string(),
        commit: commit.to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl GitserverClient for MockGitserverClient {
    async fn fetch_tar(&self, repo: &str, commit: &str, paths: &[String]) -> Result<ArchiveReader> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.fetch_calls.push(FetchCall {
                repo: repo.to_string(),
                commit: commit.to_string(),
                paths: paths.to_vec(),
            });
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if let Some(message) = &state.fetch_error {
            return Err(upstream(repo, commit, message));
        }
        let tree = state
            .trees
            .get(&(repo.to_string(), commit.to_string()))
            .ok_or_else(|| upstream(repo, commit, "unknown commit"))?;

        let files: Vec<(&str, &[u8])> = tree
            .iter()
            .filter(|(path, _)| paths.is_empty() || paths.contains(path))
            .map(|(path, data)| (path.as_str(), data.as_slice()))
            .collect();
        Ok(Box::new(Cursor::new(build_tar(&files))))
    }

    async fn git_diff(&self, repo: &str, from: &str, to: &str) -> Result<Changes> {
        let mut state = self.state.lock().unwrap();
        state
            .diff_calls
            .push((repo.to_string(), from.to_string(), to.to_string()));
        if let Some(message) = &state.diff_error {
            return Err(upstream(repo, to, message));
        }
        if let Some(changes) = state
            .diff_overrides
            .get(&(repo.to_string(), from.to_string(), to.to_string()))
        {
            return Ok(changes.clone());
        }

        let old = state
            .trees
            .get(&(repo.to_string(), from.to_string()))
            .ok_or_else(|| upstream(repo, from, "unknown commit"))?;
        let new = state
            .trees
            .get(&(repo.to_string(), to.to_string()))
            .ok_or_else(|| upstream(repo, to, "unknown commit"))?;

        let mut changes = Changes::default();
        for (path, data) in new {
            match old.get(path) {
                None => changes.added.push(path.clone()),
                Some(prev) if prev != data => changes.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in old.keys() {
            if !new.contains_key(path) {
                changes.deleted.push(path.clone());
            }
        }
        Ok(changes)
    }
}

// ─── MockParser ─────────────────────────────────────────────────────

/// Recognises `func Name`, `type Name` and `var Name` at the start of a line.
/// Files containing `PARSE_ERROR` fail to parse.
#[derive(Default)]
pub struct MockParser {
    calls: AtomicUsize,
    parsed_paths: Mutex<Vec<String>>,
}

impl MockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn parsed_paths(&self) -> Vec<String> {
        let mut paths = self.parsed_paths.lock().unwrap().clone();
        paths.sort();
        paths
    }
}

impl SymbolParser for MockParser {
    fn parse(&self, path: &str, data: &[u8]) -> Result<Vec<Symbol>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.parsed_paths.lock().unwrap().push(path.to_string());

        let text = String::from_utf8_lossy(data);
        if text.contains("PARSE_ERROR") {
            return Err(SymbolsError::Parse {
                path: path.to_string(),
                message: "mock parse failure".to_string(),
            });
        }

        let mut symbols = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim_start();
            let (kind, rest) = if let Some(rest) = line.strip_prefix("func ") {
                ("function", rest)
            } else if let Some(rest) = line.strip_prefix("type ") {
                ("type", rest)
            } else if let Some(rest) = line.strip_prefix("var ") {
                ("variable", rest)
            } else {
                continue;
            };
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if name.is_empty() {
                continue;
            }
            symbols.push(Symbol {
                name,
                path: path.to_string(),
                line: i as u32 + 1,
                kind: kind.to_string(),
                parent: String::new(),
            });
        }
        Ok(symbols)
    }
}
