//! In-memory fakes for the repository and container adapters.
//!
//! The fake repository models just enough git: a head pointer, branch tip
//! commits, and real worktree directories on disk so change detection and
//! cleanup behave like the production adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use laforge::container::{ContainerError, ContainerRuntime, RunResult, RunSpec};
use laforge::error::{CoreError, CoreResult};
use laforge::repo::{MergeOutcome, Repository};

/// Mutable state of the fake repository.
#[derive(Debug, Default)]
pub struct RepoState {
    /// Current head of the default branch.
    pub head: String,
    /// Commit counter used to mint shas.
    pub counter: u32,
    /// Tip commit per branch.
    pub branch_commits: HashMap<String, String>,
    /// Branches deleted via the adapter.
    pub deleted_branches: Vec<String>,
    /// Worktrees removed via the adapter.
    pub removed_worktrees: Vec<PathBuf>,
    /// Arguments of every reset call.
    pub reset_to: Vec<String>,
    /// Force the next merge to conflict.
    pub conflict_on_merge: bool,
    /// Force worktree creation to fail.
    pub fail_worktree: bool,
    /// Extra branch names reported by `list_branches`.
    pub extra_branches: Vec<String>,
}

/// Fake [`Repository`] with observable state.
#[derive(Debug)]
pub struct FakeRepository {
    /// Shared state for assertions.
    pub state: Mutex<RepoState>,
}

impl FakeRepository {
    /// A repository whose head starts at `head`.
    pub fn new(head: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RepoState {
                head: head.to_owned(),
                ..RepoState::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RepoState> {
        self.state.lock().expect("fake repo state poisoned")
    }

    /// Current head commit.
    pub fn head(&self) -> String {
        self.lock().head.clone()
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn head_commit(&self, _root: &Path) -> CoreResult<String> {
        Ok(self.lock().head.clone())
    }

    async fn init_repository(&self, _root: &Path) -> CoreResult<String> {
        let mut state = self.lock();
        state.head = "c0".to_owned();
        Ok(state.head.clone())
    }

    async fn create_worktree(
        &self,
        _root: &Path,
        branch_name: &str,
        path: &Path,
    ) -> CoreResult<PathBuf> {
        if self.lock().fail_worktree {
            return Err(CoreError::Host("cannot create worktree".into()));
        }
        std::fs::create_dir_all(path)?;
        self.lock()
            .branch_commits
            .insert(branch_name.to_owned(), String::new());
        Ok(path.to_path_buf())
    }

    async fn has_changes(&self, worktree: &Path) -> CoreResult<bool> {
        let mut entries = std::fs::read_dir(worktree)?;
        Ok(entries.next().is_some())
    }

    async fn commit_all(&self, worktree: &Path, _message: &str) -> CoreResult<String> {
        let branch = worktree
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CoreError::Host("worktree has no branch name".into()))?
            .to_owned();
        let mut state = self.lock();
        state.counter = state.counter.saturating_add(1);
        let sha = format!("c{}", state.counter);
        state.branch_commits.insert(branch, sha.clone());
        Ok(sha)
    }

    async fn merge_into(
        &self,
        _root: &Path,
        from_branch: &str,
        _message: &str,
    ) -> CoreResult<MergeOutcome> {
        let mut state = self.lock();
        if state.conflict_on_merge {
            return Ok(MergeOutcome::Conflict);
        }
        let tip = state
            .branch_commits
            .get(from_branch)
            .cloned()
            .ok_or_else(|| CoreError::Host(format!("unknown branch {from_branch}")))?;
        state.head = tip.clone();
        Ok(MergeOutcome::Merged(tip))
    }

    async fn delete_branch(&self, _root: &Path, branch_name: &str) -> CoreResult<()> {
        let mut state = self.lock();
        state.branch_commits.remove(branch_name);
        state.deleted_branches.push(branch_name.to_owned());
        Ok(())
    }

    async fn reset_hard(&self, _root: &Path, sha: &str) -> CoreResult<()> {
        let mut state = self.lock();
        state.head = sha.to_owned();
        state.reset_to.push(sha.to_owned());
        Ok(())
    }

    async fn remove_worktree(&self, _root: &Path, worktree: &Path) -> CoreResult<()> {
        let _ = std::fs::remove_dir_all(worktree);
        self.lock().removed_worktrees.push(worktree.to_path_buf());
        Ok(())
    }

    async fn is_ancestor(
        &self,
        _root: &Path,
        _ancestor: &str,
        _descendant: &str,
    ) -> CoreResult<bool> {
        Ok(true)
    }

    async fn list_branches(&self, _root: &Path, prefix: &str) -> CoreResult<Vec<String>> {
        let state = self.lock();
        Ok(state
            .branch_commits
            .keys()
            .cloned()
            .chain(state.extra_branches.iter().cloned())
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn prune_worktrees(&self, _root: &Path) -> CoreResult<()> {
        Ok(())
    }
}

/// Scripted [`ContainerRuntime`].
#[derive(Debug)]
pub struct FakeRuntime {
    /// Exit code to report.
    pub exit_code: i64,
    /// Captured output to report.
    pub output: String,
    /// File (name, contents) written into the worktree mount before exit.
    pub write_file: Option<(String, String)>,
    /// Fail with an infrastructure error instead of running.
    pub fail: bool,
    /// Every spec this runtime was asked to run.
    pub specs: Mutex<Vec<RunSpec>>,
}

impl FakeRuntime {
    /// A runtime that exits `exit_code` and writes `write_file`.
    pub fn new(exit_code: i64, write_file: Option<(String, String)>) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            output: "agent output\n".to_owned(),
            write_file,
            fail: false,
            specs: Mutex::new(Vec::new()),
        })
    }

    /// A runtime that always fails host-side.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            exit_code: 0,
            output: String::new(),
            write_file: None,
            fail: true,
            specs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(
        &self,
        spec: RunSpec,
        _cancel: &CancellationToken,
    ) -> Result<RunResult, ContainerError> {
        if self.fail {
            return Err(ContainerError::Infrastructure("daemon unreachable".into()));
        }
        if let Some((name, contents)) = &self.write_file {
            let target = spec.mounts[0].host_path.join(name);
            std::fs::write(&target, contents)
                .map_err(|e| ContainerError::Infrastructure(e.to_string()))?;
        }
        self.specs
            .lock()
            .expect("spec log poisoned")
            .push(spec);
        Ok(RunResult {
            exit_code: self.exit_code,
            output: self.output.clone(),
            duration: Duration::from_millis(5),
        })
    }

    async fn available(&self) -> bool {
        true
    }
}
