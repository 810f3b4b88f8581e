//! Single-step execution engine.
//!
//! One step walks a fixed lifecycle: resolve the agent profile, snapshot
//! the tasks store, create a worktree on a fresh `step-S{id}` branch, run
//! the agent container against the worktree and snapshot, capture its
//! output, commit whatever changed, merge on a zero exit, finalize the
//! step row, and overlay the mutated snapshot onto the canonical tasks
//! store. Every failed transition aborts the step with a synthetic exit
//! code; cleanup runs on every path.
//!
//! The project coordinator's exclusive lease brackets the two mutating
//! windows (preparation, and commit-through-publish). The container run
//! itself holds no lease: it only touches the step's private worktree and
//! snapshot, and readers must stay live for its whole duration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{profiles::DEFAULT_PROFILE, AgentProfile, AgentRegistry, ExtractorRegistry};
use crate::config::TimeoutConfig;
use crate::container::{
    ContainerRuntime, Mount, RunResult, RunSpec, EXIT_CODE_HOST_FAILURE,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, StepEvent};
use crate::project::ProjectHandle;
use crate::repo::{MergeOutcome, Repository};
use crate::store::snapshot;
use crate::store::Step;

/// Options for one step invocation.
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Agent profile name.
    pub profile: String,
    /// Override of the profile's container deadline.
    pub deadline_override: Option<Duration>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            profile: DEFAULT_PROFILE.to_owned(),
            deadline_override: None,
        }
    }
}

/// Result of a completed (not necessarily successful) step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// The finalized step row.
    pub step: Step,
    /// Whether the step branch was merged into the default branch.
    pub merged: bool,
}

/// Everything prepared before the container runs.
struct PreparedStep {
    step: Step,
    profile: AgentProfile,
    worktree: PathBuf,
    // Owns the snapshot directory; dropping it removes the copy.
    _snapshot_dir: tempfile::TempDir,
    snapshot_db: PathBuf,
}

/// Runs one step end-to-end, coordinating stores, repository, container
/// runtime, and event publication.
pub struct StepRunner {
    repo: Arc<dyn Repository>,
    runtime: Arc<dyn ContainerRuntime>,
    extractors: Arc<ExtractorRegistry>,
    timeouts: TimeoutConfig,
}

impl StepRunner {
    /// Assemble a runner from its adapters.
    pub fn new(
        repo: Arc<dyn Repository>,
        runtime: Arc<dyn ContainerRuntime>,
        extractors: Arc<ExtractorRegistry>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            repo,
            runtime,
            extractors,
            timeouts,
        }
    }

    /// Run one step for `handle`.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when a step is already running, `Validation` /
    /// `NotFound` for profile problems, `Host` for operational failures.
    /// An agent non-zero exit is not an error; it is recorded on the
    /// returned step.
    pub async fn run_step(
        &self,
        handle: &ProjectHandle,
        options: &StepOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<StepOutcome> {
        let prepared = self.prepare(handle, options).await?;
        let step_id = prepared.step.id;
        info!(
            project = %handle.project.id,
            step = %prepared.step.display_id(),
            profile = %options.profile,
            "step started"
        );

        let result = self.drive(handle, &prepared, cancel).await;
        let merged = matches!(&result, Ok(outcome) if outcome.merged);
        self.cleanup(handle, &prepared, merged).await;

        match &result {
            Ok(outcome) => info!(
                project = %handle.project.id,
                step = step_id,
                exit_code = outcome.step.exit_code,
                merged = outcome.merged,
                "step finished"
            ),
            Err(e) => warn!(project = %handle.project.id, step = step_id, error = %e, "step aborted"),
        }
        result
    }

    /// INIT through WORKTREE_READY, under the coordinator's write lease.
    async fn prepare(
        &self,
        handle: &ProjectHandle,
        options: &StepOptions,
    ) -> CoreResult<PreparedStep> {
        let _lease = handle.write_lease().await;

        // Fail fast on profile problems before any side effect.
        let registry = AgentRegistry::load(&handle.paths.agents_file)?;
        let mut profile = registry
            .get(&options.profile)?
            .resolve(|name| std::env::var(name).ok())?;
        if let Some(deadline) = options.deadline_override {
            profile.deadline_secs = deadline.as_secs().max(1);
        }

        let snapshot_dir = tempfile::Builder::new()
            .prefix("step-snapshot-")
            .tempdir_in(&handle.paths.root)
            .map_err(|e| CoreError::Host(format!("failed to create snapshot dir: {e}")))?;
        let snapshot_db = snapshot_dir.path().join("tasks.db");
        snapshot::snapshot_to(&handle.paths.tasks_db, &snapshot_db).await?;

        let commit_before = self.repo.head_commit(&handle.paths.source_root).await?;

        let parent = handle.steps.latest_active(&handle.project.id).await?;
        let profile_json = serde_json::to_value(&profile)
            .map_err(|e| CoreError::Host(format!("failed to serialize profile: {e}")))?;
        let step = handle
            .steps
            .begin_step(
                &handle.project.id,
                parent.map(|p| p.id),
                &commit_before,
                &profile_json,
            )
            .await?;

        let worktree = handle.paths.worktrees_dir.join(step.branch_name());
        match self
            .repo
            .create_worktree(&handle.paths.source_root, &step.branch_name(), &worktree)
            .await
        {
            Ok(path) => Ok(PreparedStep {
                step,
                profile,
                worktree: path,
                _snapshot_dir: snapshot_dir,
                snapshot_db,
            }),
            Err(e) => {
                // Abort before the container ever starts.
                let failed = handle
                    .steps
                    .fail_step(step.id, EXIT_CODE_HOST_FAILURE)
                    .await?;
                handle.hub.publish(&Event::StepCompleted(StepEvent {
                    step_id: failed.id,
                    exit_code: failed.exit_code,
                    merged: false,
                }));
                Err(e)
            }
        }
    }

    /// CONTAINER_RUN through FINALIZED.
    async fn drive(
        &self,
        handle: &ProjectHandle,
        prepared: &PreparedStep,
        cancel: &CancellationToken,
    ) -> CoreResult<StepOutcome> {
        let run = self.run_container(handle, prepared, cancel).await;

        match run {
            Ok(result) => self.finalize(handle, prepared, &result).await,
            Err(e) => {
                let _lease = handle.write_lease().await;
                let failed = handle
                    .steps
                    .fail_step(prepared.step.id, EXIT_CODE_HOST_FAILURE)
                    .await?;
                handle.hub.publish(&Event::StepCompleted(StepEvent {
                    step_id: failed.id,
                    exit_code: failed.exit_code,
                    merged: false,
                }));
                Err(e)
            }
        }
    }

    /// Launch the agent container and persist its captured output.
    ///
    /// Runs without a coordinator lease: the container only sees the
    /// step's private worktree and tasks snapshot.
    async fn run_container(
        &self,
        handle: &ProjectHandle,
        prepared: &PreparedStep,
        cancel: &CancellationToken,
    ) -> CoreResult<RunResult> {
        let profile = &prepared.profile;
        let step = &prepared.step;

        let mut env: Vec<(String, String)> = profile
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("LAFORGE_PROJECT".to_owned(), handle.project.id.clone()));
        env.push(("LAFORGE_STEP".to_owned(), step.id.to_string()));
        env.push(("LAFORGE_TASKS_DB".to_owned(), profile.state_mount.clone()));

        let spec = RunSpec {
            name: format!("laforge-{}-{}", handle.project.id, step.branch_name()),
            image: profile.image.clone(),
            env,
            mounts: vec![
                Mount {
                    host_path: prepared.worktree.clone(),
                    container_path: profile.source_mount.clone(),
                    read_only: false,
                },
                Mount {
                    host_path: prepared.snapshot_db.clone(),
                    container_path: profile.state_mount.clone(),
                    read_only: false,
                },
            ],
            deadline: profile.deadline(),
            command: profile.command.clone(),
            memory_mb: profile.memory_mb,
            cpu_cores: profile.cpu_cores,
        };

        // The overall budget is strictly wider than the container deadline,
        // so expiry here means the runtime itself failed to stop the run.
        let overall = profile
            .deadline()
            .saturating_add(self.timeouts.orchestration_budget());
        let result = tokio::time::timeout(overall, self.runtime.run(spec, cancel))
            .await
            .map_err(|_| {
                CoreError::Host(format!(
                    "container run exceeded the overall budget of {}s",
                    overall.as_secs()
                ))
            })??;

        self.persist_output(handle, step.id, &result).await;
        Ok(result)
    }

    async fn persist_output(&self, handle: &ProjectHandle, step_id: i64, result: &RunResult) {
        let dir = handle.paths.step_log_dir(step_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(step = step_id, error = %e, "failed to create step log dir");
            return;
        }
        if let Err(e) = tokio::fs::write(dir.join("output.log"), &result.output).await {
            warn!(step = step_id, error = %e, "failed to persist step output");
        }
    }

    /// COMMITTED through FINALIZED, under the coordinator's write lease.
    async fn finalize(
        &self,
        handle: &ProjectHandle,
        prepared: &PreparedStep,
        result: &RunResult,
    ) -> CoreResult<StepOutcome> {
        let _lease = handle.write_lease().await;
        let step = &prepared.step;
        let source_root = &handle.paths.source_root;

        let commit_after = if self.repo.has_changes(&prepared.worktree).await? {
            let message = format!("{}: agent changes", step.display_id());
            Some(self.repo.commit_all(&prepared.worktree, &message).await?)
        } else {
            None
        };

        let merged = if result.success() && commit_after.is_some() {
            let message = format!("Merge {}", step.branch_name());
            match self
                .repo
                .merge_into(source_root, &step.branch_name(), &message)
                .await?
            {
                MergeOutcome::Merged(_) => true,
                MergeOutcome::Conflict => {
                    warn!(
                        step = %step.display_id(),
                        "merge conflict; step branch left for manual resolution"
                    );
                    false
                }
            }
        } else {
            false
        };

        let usage = self
            .extractors
            .extract(prepared.profile.usage_family.as_deref(), &result.output)
            .map(|u| serde_json::json!(u));

        let finished = handle
            .steps
            .finish_step(
                step.id,
                commit_after.as_deref(),
                result.exit_code,
                usage.as_ref(),
            )
            .await?;

        // Overlay inside the same critical section that publishes, so
        // observers never see task state and step state disagree. A busy
        // reader can make the overlay transiently fail; retry before
        // escalating to an operational error.
        if result.success() {
            crate::error::retry_transient(|| {
                snapshot::overlay_from(handle.tasks.pool(), &prepared.snapshot_db)
            })
            .await?;
        }

        handle.hub.publish(&Event::StepCompleted(StepEvent {
            step_id: finished.id,
            exit_code: finished.exit_code,
            merged,
        }));

        Ok(StepOutcome {
            step: finished,
            merged,
        })
    }

    /// Cleanup runs on every exit path: drop the worktree, delete the step
    /// branch iff the merge landed, and let the snapshot directory delete
    /// itself on drop.
    async fn cleanup(&self, handle: &ProjectHandle, prepared: &PreparedStep, merged: bool) {
        let source_root = &handle.paths.source_root;
        if let Err(e) = self
            .repo
            .remove_worktree(source_root, &prepared.worktree)
            .await
        {
            warn!(step = prepared.step.id, error = %e, "worktree removal failed");
        }
        if merged {
            if let Err(e) = self
                .repo
                .delete_branch(source_root, &prepared.step.branch_name())
                .await
            {
                warn!(step = prepared.step.id, error = %e, "branch deletion failed");
            }
        }
    }

    /// Garbage-collect debris left by a killed process.
    ///
    /// Orphaned running steps (impossible at startup: this process holds
    /// the project lock) are failed with a synthetic host code. Branches
    /// named `step-S*` whose steps are terminal with no captured commit
    /// carry nothing and are removed along with their worktrees.
    ///
    /// # Errors
    ///
    /// Returns `Host` on repository failures.
    pub async fn gc_stale(&self, handle: &ProjectHandle) -> CoreResult<u32> {
        let _lease = handle.write_lease().await;
        let source_root = &handle.paths.source_root;
        let mut collected: u32 = 0;

        if let Some(orphan) = handle.steps.running(&handle.project.id).await? {
            warn!(step = orphan.id, "failing step orphaned by a previous process");
            let failed = handle
                .steps
                .fail_step(orphan.id, EXIT_CODE_HOST_FAILURE)
                .await?;
            handle.hub.publish(&Event::StepCompleted(StepEvent {
                step_id: failed.id,
                exit_code: failed.exit_code,
                merged: false,
            }));
        }

        for branch in self.repo.list_branches(source_root, "step-S").await? {
            let Some(step_id) = branch
                .strip_prefix("step-S")
                .and_then(|raw| raw.parse::<i64>().ok())
            else {
                continue;
            };
            let Ok(step) = handle.steps.get(step_id).await else {
                continue;
            };
            if step.is_running() || step.commit_after.is_some() {
                continue;
            }
            let worktree = handle.paths.worktrees_dir.join(&branch);
            if let Err(e) = self.repo.remove_worktree(source_root, &worktree).await {
                warn!(branch = %branch, error = %e, "stale worktree removal failed");
            }
            if let Err(e) = self.repo.delete_branch(source_root, &branch).await {
                warn!(branch = %branch, error = %e, "stale branch deletion failed");
                continue;
            }
            collected = collected.saturating_add(1);
        }
        self.repo.prune_worktrees(source_root).await?;
        Ok(collected)
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner").finish_non_exhaustive()
    }
}
