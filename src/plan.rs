//! Plan-document ingestion.
//!
//! A review whose attachment is a recognized plan document (a
//! `*.plan.json` file with a closed record shape) gets applied to the task
//! store when the review is approved: records with an id update the
//! existing task, records without insert a new one, and the whole batch
//! commits or rolls back together under the task invariants. Unknown
//! fields are a validation error, never a silent drop.

use std::path::{Component, Path};

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::store::{TaskReview, TaskStore};

/// File suffix that marks a review attachment as a plan document.
pub const PLAN_SUFFIX: &str = ".plan.json";

/// A parsed plan document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanDocument {
    /// Task upserts, applied in order.
    pub tasks: Vec<PlanTaskRecord>,
}

/// One task upsert from a plan document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanTaskRecord {
    /// Existing task id to update; absent inserts a new task.
    #[serde(default)]
    pub id: Option<i64>,
    /// Task title.
    pub title: String,
    /// Task description.
    #[serde(default)]
    pub description: String,
    /// Acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: String,
    /// Type tag (EPIC, FEAT, ...); defaults to FEAT.
    #[serde(default)]
    pub task_type: Option<String>,
    /// Upstream dependency id, nullable.
    #[serde(default)]
    pub upstream_id: Option<i64>,
    /// Whether completion requires an approved review.
    #[serde(default)]
    pub review_required: bool,
    /// Parent task id, nullable.
    #[serde(default)]
    pub parent_id: Option<i64>,
    /// Task status; defaults to todo.
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "todo".to_owned()
}

/// Whether `attachment_path` names a plan document.
pub fn is_plan_document(attachment_path: &str) -> bool {
    attachment_path.ends_with(PLAN_SUFFIX)
}

/// Parse a plan document, rejecting unknown fields.
///
/// # Errors
///
/// Returns `Validation` with the parser's diagnostics.
pub fn parse_plan(contents: &str) -> CoreResult<PlanDocument> {
    serde_json::from_str(contents)
        .map_err(|e| CoreError::Validation(format!("invalid plan document: {e}")))
}

/// Resolve a review attachment path inside the source root.
///
/// The attachment is stored relative to the source root; absolute paths
/// and parent traversal are rejected.
fn resolve_attachment(source_root: &Path, attachment: &str) -> CoreResult<std::path::PathBuf> {
    let relative = Path::new(attachment);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(CoreError::Validation(format!(
            "attachment path {attachment:?} must stay inside the source root"
        )));
    }
    Ok(source_root.join(relative))
}

/// Apply an approved review's plan document, if its attachment is one.
///
/// Returns the applied task ids, or `None` when the attachment is absent
/// or not a plan document (those are left untouched).
///
/// # Errors
///
/// Returns `Validation` for an unreadable or malformed document and the
/// underlying invariant error when the batch is rejected; the store is
/// unchanged on any error.
pub async fn apply_review_plan(
    tasks: &TaskStore,
    source_root: &Path,
    review: &TaskReview,
) -> CoreResult<Option<Vec<i64>>> {
    let Some(attachment) = review.attachment_path.as_deref() else {
        return Ok(None);
    };
    if !is_plan_document(attachment) {
        return Ok(None);
    }

    let path = resolve_attachment(source_root, attachment)?;
    let contents = std::fs::read_to_string(&path).map_err(|e| {
        CoreError::Validation(format!(
            "plan document {attachment:?} could not be read: {e}"
        ))
    })?;
    let plan = parse_plan(&contents)?;
    let applied = tasks.apply_plan_batch(&plan.tasks).await?;
    tracing::info!(
        review = review.id,
        tasks = applied.len(),
        "plan document applied"
    );
    Ok(Some(applied))
}
