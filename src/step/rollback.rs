//! Rollback: deactivate a suffix of the step history and revert the
//! repository to the target step's pre-commit.
//!
//! Rollback never touches task data. Rolling back to a step that is
//! already inactive is rejected, so a replay is an error that mutates
//! nothing.

use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::events::{Event, RollbackEvent};
use crate::project::ProjectHandle;
use crate::repo::Repository;

/// Deactivate every step from `target_step_id` on and hard-reset the
/// repository to that step's `commit_before`.
///
/// Publishes one rollback event naming the deactivated range.
///
/// # Errors
///
/// Returns `NotFound` for a missing step, `Conflict` for an inactive
/// target, a step of another project, or a step still running.
pub async fn rollback(
    handle: &ProjectHandle,
    repo: &dyn Repository,
    target_step_id: i64,
) -> CoreResult<Vec<i64>> {
    let _lease = handle.write_lease().await;

    let target = handle.steps.get(target_step_id).await?;
    if target.project_id != handle.project.id {
        return Err(CoreError::not_found("step", target_step_id));
    }
    if !target.active {
        return Err(CoreError::Conflict(format!(
            "step S{target_step_id} is already inactive; nothing to roll back"
        )));
    }
    if let Some(running) = handle.steps.running(&handle.project.id).await? {
        return Err(CoreError::Conflict(format!(
            "step S{} is still running; rollback is not possible",
            running.id
        )));
    }

    let deactivated = handle
        .steps
        .deactivate_from(&handle.project.id, target_step_id)
        .await?;
    repo.reset_hard(&handle.paths.source_root, &target.commit_before)
        .await?;

    info!(
        project = %handle.project.id,
        target = target_step_id,
        count = deactivated.len(),
        "rolled back step history"
    );
    handle.hub.publish(&Event::StepsRolledBack(RollbackEvent {
        target_step_id,
        deactivated: deactivated.clone(),
    }));
    Ok(deactivated)
}
