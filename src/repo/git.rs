//! `git`-backed [`Repository`] implementation.
//!
//! Shells out to the `git` binary via `tokio::process`. Commits are made
//! with a fixed harness identity so steps never depend on host-level git
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{MergeOutcome, Repository};
use crate::error::{CoreError, CoreResult};

const COMMIT_AUTHOR_NAME: &str = "laforge";
const COMMIT_AUTHOR_EMAIL: &str = "laforge@localhost";

/// Repository adapter shelling out to the `git` binary.
#[derive(Debug, Clone)]
pub struct GitRepository {
    merge_timeout: Duration,
}

impl GitRepository {
    /// Create the adapter with the given merge budget.
    pub fn new(merge_timeout: Duration) -> Self {
        Self { merge_timeout }
    }

    /// Returns true when a usable `git` binary is on the path.
    pub async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> CoreResult<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("-c")
            .arg(format!("user.name={COMMIT_AUTHOR_NAME}"))
            .arg("-c")
            .arg(format!("user.email={COMMIT_AUTHOR_EMAIL}"))
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::Host(format!("failed to spawn git: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if output.status.success() {
            debug!(dir = %dir.display(), ?args, "git ok");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            Err(CoreError::Host(format!(
                "git {} failed: {stderr}",
                args.first().copied().unwrap_or("?")
            )))
        }
    }

    /// Like [`Self::git`] but hands back (success, stdout, stderr) without
    /// mapping a nonzero exit to an error. Used where exit status is data.
    async fn git_status(&self, dir: &Path, args: &[&str]) -> CoreResult<(bool, String, String)> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .arg("-c")
            .arg(format!("user.name={COMMIT_AUTHOR_NAME}"))
            .arg("-c")
            .arg(format!("user.email={COMMIT_AUTHOR_EMAIL}"))
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::Host(format!("failed to spawn git: {e}")))?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        ))
    }
}

#[async_trait]
impl Repository for GitRepository {
    async fn head_commit(&self, root: &Path) -> CoreResult<String> {
        self.git(root, &["rev-parse", "HEAD"]).await
    }

    async fn init_repository(&self, root: &Path) -> CoreResult<String> {
        tokio::fs::create_dir_all(root).await?;
        self.git(root, &["init", "--initial-branch=main"]).await?;
        self.git(
            root,
            &["commit", "--allow-empty", "-m", "Initialize project"],
        )
        .await?;
        self.head_commit(root).await
    }

    async fn create_worktree(
        &self,
        root: &Path,
        branch_name: &str,
        path: &Path,
    ) -> CoreResult<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path
            .to_str()
            .ok_or_else(|| CoreError::Host("worktree path is not valid UTF-8".into()))?;
        self.git(
            root,
            &["worktree", "add", "-b", branch_name, path_str, "HEAD"],
        )
        .await?;
        Ok(path.to_path_buf())
    }

    async fn has_changes(&self, worktree: &Path) -> CoreResult<bool> {
        let status = self.git(worktree, &["status", "--porcelain"]).await?;
        Ok(!status.is_empty())
    }

    async fn commit_all(&self, worktree: &Path, message: &str) -> CoreResult<String> {
        self.git(worktree, &["add", "-A"]).await?;
        self.git(worktree, &["commit", "-m", message]).await?;
        self.git(worktree, &["rev-parse", "HEAD"]).await
    }

    async fn merge_into(
        &self,
        root: &Path,
        from_branch: &str,
        message: &str,
    ) -> CoreResult<MergeOutcome> {
        let merge = tokio::time::timeout(
            self.merge_timeout,
            self.git_status(root, &["merge", "--no-ff", "-m", message, from_branch]),
        )
        .await;

        match merge {
            Ok(Ok((true, _, _))) => Ok(MergeOutcome::Merged(self.head_commit(root).await?)),
            Ok(Ok((false, stdout, stderr))) => {
                // A conflicted merge leaves the index dirty; abort restores
                // the pre-merge state so the target branch is untouched.
                let _ = self.git_status(root, &["merge", "--abort"]).await;
                if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") {
                    Ok(MergeOutcome::Conflict)
                } else {
                    Err(CoreError::Host(format!("git merge failed: {stderr}")))
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = self.git_status(root, &["merge", "--abort"]).await;
                Err(CoreError::Host(format!(
                    "git merge exceeded {}s budget",
                    self.merge_timeout.as_secs()
                )))
            }
        }
    }

    async fn delete_branch(&self, root: &Path, branch_name: &str) -> CoreResult<()> {
        self.git(root, &["branch", "-D", branch_name]).await?;
        Ok(())
    }

    async fn reset_hard(&self, root: &Path, sha: &str) -> CoreResult<()> {
        self.git(root, &["reset", "--hard", sha]).await?;
        Ok(())
    }

    async fn remove_worktree(&self, root: &Path, worktree: &Path) -> CoreResult<()> {
        let path_str = worktree
            .to_str()
            .ok_or_else(|| CoreError::Host("worktree path is not valid UTF-8".into()))?;
        let (ok, _, stderr) = self
            .git_status(root, &["worktree", "remove", "--force", path_str])
            .await?;
        if !ok && !stderr.contains("is not a working tree") {
            return Err(CoreError::Host(format!(
                "git worktree remove failed: {stderr}"
            )));
        }
        Ok(())
    }

    async fn is_ancestor(
        &self,
        root: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> CoreResult<bool> {
        let (ok, _, _) = self
            .git_status(root, &["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(ok)
    }

    async fn list_branches(&self, root: &Path, prefix: &str) -> CoreResult<Vec<String>> {
        let pattern = format!("refs/heads/{prefix}*");
        let out = self
            .git(
                root,
                &["for-each-ref", "--format=%(refname:short)", &pattern],
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    async fn prune_worktrees(&self, root: &Path) -> CoreResult<()> {
        self.git(root, &["worktree", "prune"]).await?;
        Ok(())
    }
}
