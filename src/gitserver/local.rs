//! [`GitserverClient`] backed by the `git` CLI for repositories on local disk.
//!
//! `git archive` output is streamed straight from the child's stdout, so a
//! large tree never has to be buffered in memory.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use async_trait::async_trait;
use tracing::debug;

use super::{ArchiveReader, GitserverClient};
use crate::Changes;
use crate::error::{Result, SymbolsError};

/// Resolves repository names to directories and shells out to `git`.
///
/// With a `repos_root`, repository `github.com/foo/bar` lives at
/// `<repos_root>/github.com/foo/bar`; without one the name is used as a path.
#[derive(Debug, Clone, Default)]
pub struct LocalGitClient {
    repos_root: Option<PathBuf>,
}

impl LocalGitClient {
    pub fn new(repos_root: Option<PathBuf>) -> Self {
        Self { repos_root }
    }

    fn repo_path(&self, repo: &str) -> PathBuf {
        match &self.repos_root {
            Some(root) => root.join(repo),
            None => PathBuf::from(repo),
        }
    }
}

fn upstream(repo: &str, commit: &str, message: impl Into<String>) -> SymbolsError {
    SymbolsError::Upstream {
        repo: repo.to_string(),
        commit: commit.to_string(),
        message: message.into(),
    }
}

/// Run a git command to completion and return its stdout.
fn run_git(cmd: &mut Command) -> std::result::Result<Vec<u8>, String> {
    let output = cmd
        .output()
        .map_err(|e| format!("Failed to execute git: {}. Is git installed and in PATH?", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git command failed: {}", stderr.trim()));
    }

    Ok(output.stdout)
}

/// Parse `git diff --name-status -z` output: NUL-separated status/path pairs.
///
/// Type changes and anything unexpected count as modifications.
pub(crate) fn parse_name_status(output: &[u8]) -> Changes {
    let mut changes = Changes::default();
    let mut fields = output
        .split(|&b| b == 0)
        .filter(|f| !f.is_empty())
        .map(|f| String::from_utf8_lossy(f).into_owned());

    while let (Some(status), Some(path)) = (fields.next(), fields.next()) {
        match status.chars().next() {
            Some('A') => changes.added.push(path),
            Some('D') => changes.deleted.push(path),
            _ => changes.modified.push(path),
        }
    }
    changes
}

/// Pathspec matching exactly `path`: no globbing, no `:` magic.
fn literal_pathspec(path: &str) -> String {
    format!(":(literal){}", path)
}

/// Stdout of a running `git archive`. A non-zero exit status surfaces as a
/// read error once the stream is exhausted.
struct GitArchiveReader {
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for GitArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Err(io::Error::other(format!("git archive failed: {}", stderr.trim())));
            }
        }
        Ok(n)
    }
}

impl Drop for GitArchiveReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[async_trait]
impl GitserverClient for LocalGitClient {
    async fn fetch_tar(&self, repo: &str, commit: &str, paths: &[String]) -> Result<ArchiveReader> {
        let repo_path = self.repo_path(repo);
        let (repo, commit, paths) = (repo.to_string(), commit.to_string(), paths.to_vec());

        tokio::task::spawn_blocking(move || {
            // Resolve the tree up front so a bad commit fails the fetch instead
            // of surfacing halfway through the stream.
            run_git(
                Command::new("git")
                    .current_dir(&repo_path)
                    .arg("cat-file")
                    .arg("-e")
                    .arg(format!("{}^{{tree}}", commit)),
            )
            .map_err(|e| upstream(&repo, &commit, e))?;

            let mut cmd = Command::new("git");
            cmd.current_dir(&repo_path)
                .arg("archive")
                .arg("--format=tar")
                .arg(&commit);
            if !paths.is_empty() {
                cmd.arg("--").args(paths.iter().map(|p| literal_pathspec(p)));
            }
            debug!(repo = %repo, commit = %commit, num_paths = paths.len(), "Spawning git archive");

            let mut child = cmd
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| upstream(&repo, &commit, format!("Failed to execute git: {}", e)))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| upstream(&repo, &commit, "git archive has no stdout"))?;

            Ok(Box::new(GitArchiveReader { child, stdout, finished: false }) as ArchiveReader)
        })
        .await?
    }

    async fn git_diff(&self, repo: &str, from: &str, to: &str) -> Result<Changes> {
        let repo_path = self.repo_path(repo);
        let (repo, from, to) = (repo.to_string(), from.to_string(), to.to_string());

        tokio::task::spawn_blocking(move || {
            let output = run_git(
                Command::new("git")
                    .current_dir(&repo_path)
                    .arg("diff")
                    .arg("--name-status")
                    .arg("--no-renames")
                    .arg("-z")
                    .arg(&from)
                    .arg(&to),
            )
            .map_err(|e| upstream(&repo, &to, e))?;
            Ok(parse_name_status(&output))
        })
        .await?
    }
}
