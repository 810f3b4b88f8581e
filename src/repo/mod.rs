//! Version-control adapter.
//!
//! The orchestrator only ever talks to [`Repository`]; the production
//! implementation shells out to `git`. Every mutation is atomic from the
//! caller's point of view: a merge that conflicts leaves the target branch
//! untouched and reports [`MergeOutcome::Conflict`] instead of an error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::CoreResult;

pub mod git;

pub use git::GitRepository;

/// Result of merging a step branch into the default branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge landed; the new head commit.
    Merged(String),
    /// Merge conflicted; the target branch was not modified.
    Conflict,
}

/// Narrow version-control capability set used by the step engine.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Current head commit sha of the repository at `root`.
    async fn head_commit(&self, root: &Path) -> CoreResult<String>;

    /// Initialise a fresh repository at `root` with one root commit.
    async fn init_repository(&self, root: &Path) -> CoreResult<String>;

    /// Create an isolated worktree at `path` on a fresh branch off the
    /// current tip of `root`.
    async fn create_worktree(
        &self,
        root: &Path,
        branch_name: &str,
        path: &Path,
    ) -> CoreResult<PathBuf>;

    /// Whether the worktree has uncommitted changes.
    async fn has_changes(&self, worktree: &Path) -> CoreResult<bool>;

    /// Stage everything in the worktree and commit; returns the new sha.
    async fn commit_all(&self, worktree: &Path, message: &str) -> CoreResult<String>;

    /// Merge `from_branch` into the default branch of `root`.
    async fn merge_into(
        &self,
        root: &Path,
        from_branch: &str,
        message: &str,
    ) -> CoreResult<MergeOutcome>;

    /// Delete a branch (forced).
    async fn delete_branch(&self, root: &Path, branch_name: &str) -> CoreResult<()>;

    /// Hard-reset the default branch of `root` to `sha`.
    async fn reset_hard(&self, root: &Path, sha: &str) -> CoreResult<()>;

    /// Remove a worktree registration and its directory.
    async fn remove_worktree(&self, root: &Path, worktree: &Path) -> CoreResult<()>;

    /// Whether `ancestor` is an ancestor of `descendant`.
    async fn is_ancestor(&self, root: &Path, ancestor: &str, descendant: &str)
        -> CoreResult<bool>;

    /// Local branch names starting with `prefix`.
    async fn list_branches(&self, root: &Path, prefix: &str) -> CoreResult<Vec<String>>;

    /// Drop stale worktree registrations.
    async fn prune_worktrees(&self, root: &Path) -> CoreResult<()>;
}
