//! Boundary to the code host: tree archives and path-level diffs.
//!
//! The rest of the crate only sees [`GitserverClient`]. [`local::LocalGitClient`]
//! implements it on top of the `git` CLI for repositories on local disk.

pub mod local;

use std::io::Read;

use async_trait::async_trait;

use crate::Changes;
use crate::error::Result;

pub use local::LocalGitClient;

/// A tar-formatted tree archive, read entry by entry.
pub type ArchiveReader = Box<dyn Read + Send>;

#[async_trait]
pub trait GitserverClient: Send + Sync {
    /// Tar archive of the tree at `commit`. When `paths` is non-empty the
    /// archive only contains those paths.
    async fn fetch_tar(&self, repo: &str, commit: &str, paths: &[String]) -> Result<ArchiveReader>;

    /// Paths added, modified and deleted between `from` and `to`.
    async fn git_diff(&self, repo: &str, from: &str, to: &str) -> Result<Changes>;
}
