//! REST handlers for the projection service.
//!
//! Mutating handlers take the project coordinator's exclusive lease around
//! the store write and the event publication that follows, so subscribers
//! observe events in mutation order.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use super::error::{ApiError, ApiResult};
use super::{envelope, ApiState};
use crate::events::{Event, ReviewEvent, TaskEvent};
use crate::plan;
use crate::project::ProjectHandle;
use crate::store::{
    NewTask, ReviewStatus, StepFilter, Task, TaskFilter, TaskStatus, TaskStore, TaskType,
    UpdateTaskFields,
};

async fn open(state: &ApiState, project_id: &str) -> ApiResult<Arc<ProjectHandle>> {
    Ok(state.registry.open(project_id).await?)
}

// ── Projects ────────────────────────────────────────────────────

/// `GET /projects`
pub async fn list_projects(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let projects = state.registry.list()?;
    Ok(envelope(projects))
}

// ── Tasks ───────────────────────────────────────────────────────

/// Query string for task listings and single-task reads.
#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    /// Comma list of statuses; a task matches any of them.
    pub status: Option<String>,
    /// Exact parent filter.
    pub parent_id: Option<i64>,
    /// Exact type filter.
    pub task_type: Option<String>,
    /// 1-based page.
    pub page: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
    /// Expand child tasks.
    #[serde(default)]
    pub include_children: bool,
    /// Expand log entries.
    #[serde(default)]
    pub include_logs: bool,
    /// Expand reviews.
    #[serde(default)]
    pub include_reviews: bool,
}

impl TaskQuery {
    fn filter(&self) -> ApiResult<TaskFilter> {
        let statuses = match self.status.as_deref() {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(TaskStatus::parse)
                .collect::<Result<Vec<_>, _>>()?,
        };
        let task_type = self
            .task_type
            .as_deref()
            .map(TaskType::parse)
            .transpose()?;
        Ok(TaskFilter {
            statuses,
            parent_id: self.parent_id,
            task_type,
            page: self.page,
            limit: self.limit,
        })
    }
}

async fn expand(tasks: &TaskStore, task: &mut Task, query: &TaskQuery) -> ApiResult<()> {
    if query.include_children {
        task.children = Some(tasks.children(task.id).await?);
    }
    if query.include_logs {
        task.logs = Some(tasks.logs(task.id).await?);
    }
    if query.include_reviews {
        task.reviews = Some(tasks.reviews(task.id).await?);
    }
    Ok(())
}

/// `GET /projects/{project_id}/tasks`
pub async fn list_tasks(
    State(state): State<ApiState>,
    Path(project_id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    let mut tasks = handle.tasks.list(&query.filter()?).await?;
    for task in &mut tasks {
        expand(&handle.tasks, task, &query).await?;
    }
    Ok(envelope(tasks))
}

/// `POST /projects/{project_id}/tasks`
pub async fn create_task(
    State(state): State<ApiState>,
    Path(project_id): Path<String>,
    Json(body): Json<NewTask>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let id = handle.tasks.add_with_details(body).await?;
    let task = handle.tasks.get_required(id).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id: id,
        status: Some(task.status),
        deleted: false,
    }));
    Ok((StatusCode::CREATED, envelope(task)))
}

/// `GET /projects/{project_id}/tasks/next`
pub async fn next_task(
    State(state): State<ApiState>,
    Path(project_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    let task = handle.tasks.next_ready().await?;
    let mut meta = super::meta();
    if task.is_none() {
        meta["message"] = serde_json::Value::String(
            "no queued task is ready; queue is empty or everything is blocked".to_owned(),
        );
    }
    Ok(Json(serde_json::json!({ "data": task, "meta": meta })))
}

/// `GET /projects/{project_id}/tasks/{task_id}`
pub async fn get_task(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    let mut task = handle.tasks.get_required(task_id).await?;
    expand(&handle.tasks, &mut task, &query).await?;
    Ok(envelope(task))
}

/// `PUT /projects/{project_id}/tasks/{task_id}`
pub async fn update_task(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
    Json(body): Json<UpdateTaskFields>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let task = handle.tasks.update_fields(task_id, &body).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: Some(task.status),
        deleted: false,
    }));
    Ok(envelope(task))
}

/// Body for `PUT .../status`.
#[derive(Debug, Deserialize)]
pub struct StatusBody {
    /// Target status.
    pub status: TaskStatus,
}

/// `PUT /projects/{project_id}/tasks/{task_id}/status`
pub async fn update_task_status(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
    Json(body): Json<StatusBody>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let task = handle.tasks.update_status(task_id, body.status).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: Some(task.status),
        deleted: false,
    }));
    Ok(envelope(task))
}

/// `DELETE /projects/{project_id}/tasks/{task_id}`
pub async fn delete_task(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    handle.tasks.delete(task_id).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: None,
        deleted: true,
    }));
    Ok(envelope(serde_json::json!({ "deleted": task_id })))
}

// ── Task logs ───────────────────────────────────────────────────

/// Body for `POST .../logs`.
#[derive(Debug, Deserialize)]
pub struct LogBody {
    /// Log line.
    pub message: String,
}

/// `GET /projects/{project_id}/tasks/{task_id}/logs`
pub async fn list_task_logs(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    handle.tasks.get_required(task_id).await?;
    Ok(envelope(handle.tasks.logs(task_id).await?))
}

/// `POST /projects/{project_id}/tasks/{task_id}/logs`
pub async fn append_task_log(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
    Json(body): Json<LogBody>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let log = handle.tasks.append_log(task_id, &body.message).await?;
    let task = handle.tasks.get_required(task_id).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: Some(task.status),
        deleted: false,
    }));
    Ok((StatusCode::CREATED, envelope(log)))
}

// ── Reviews ─────────────────────────────────────────────────────

/// Body for `POST .../reviews`.
#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    /// What the reviewer is asked to check.
    pub message: String,
    /// Artifact path relative to the source root.
    #[serde(default)]
    pub attachment_path: Option<String>,
}

/// `GET /projects/{project_id}/tasks/{task_id}/reviews`
pub async fn list_task_reviews(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    handle.tasks.get_required(task_id).await?;
    Ok(envelope(handle.tasks.reviews(task_id).await?))
}

/// `POST /projects/{project_id}/tasks/{task_id}/reviews`
///
/// Creates the review and transitions the task to in-review atomically.
pub async fn create_task_review(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let review = handle
        .tasks
        .create_review(task_id, &body.message, body.attachment_path.as_deref())
        .await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: Some(TaskStatus::InReview),
        deleted: false,
    }));
    handle.hub.publish(&Event::ReviewUpdated(ReviewEvent {
        review_id: review.id,
        task_id,
        status: review.status,
    }));
    Ok((StatusCode::CREATED, envelope(review)))
}

/// `GET /projects/{project_id}/reviews/{review_id}`
pub async fn get_review(
    State(state): State<ApiState>,
    Path((project_id, review_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    Ok(envelope(handle.tasks.get_review(review_id).await?))
}

/// Body for `PUT .../feedback`.
#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    /// Verdict: approved or rejected.
    pub status: ReviewStatus,
    /// Reviewer feedback; required for rejections.
    #[serde(default)]
    pub feedback: Option<String>,
}

/// `PUT /projects/{project_id}/reviews/{review_id}/feedback`
///
/// Approving a review whose attachment is a plan document applies the
/// plan's task batch atomically.
pub async fn set_review_feedback(
    State(state): State<ApiState>,
    Path((project_id, review_id)): Path<(String, i64)>,
    Json(body): Json<FeedbackBody>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let outcome = handle
        .tasks
        .set_review_feedback(review_id, body.status, body.feedback.as_deref())
        .await?;

    let applied = if outcome.newly_approved {
        plan::apply_review_plan(&handle.tasks, &handle.paths.source_root, &outcome.review).await?
    } else {
        None
    };

    handle.hub.publish(&Event::ReviewUpdated(ReviewEvent {
        review_id,
        task_id: outcome.review.task_id,
        status: outcome.review.status,
    }));
    if let Some(task_ids) = &applied {
        for task_id in task_ids {
            let task = handle.tasks.get_required(*task_id).await?;
            handle.hub.publish(&Event::TaskUpdated(TaskEvent {
                task_id: *task_id,
                status: Some(task.status),
                deleted: false,
            }));
        }
    }

    Ok(envelope(serde_json::json!({
        "review": outcome.review,
        "plan_applied_task_ids": applied,
    })))
}

// ── Work queue ──────────────────────────────────────────────────

/// `POST /projects/{project_id}/tasks/{task_id}/enqueue`
pub async fn enqueue_task(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    handle.tasks.enqueue(task_id).await?;
    let task = handle.tasks.get_required(task_id).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: Some(task.status),
        deleted: false,
    }));
    Ok(envelope(serde_json::json!({ "enqueued": task_id })))
}

/// `DELETE /projects/{project_id}/tasks/{task_id}/enqueue`
pub async fn dequeue_task(
    State(state): State<ApiState>,
    Path((project_id, task_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.write_lease().await;
    let task = handle.tasks.get_required(task_id).await?;
    handle.tasks.dequeue(task_id).await?;
    handle.hub.publish(&Event::TaskUpdated(TaskEvent {
        task_id,
        status: Some(task.status),
        deleted: false,
    }));
    Ok(envelope(serde_json::json!({ "dequeued": task_id })))
}

// ── Steps ───────────────────────────────────────────────────────

/// Query string for step listings.
#[derive(Debug, Default, Deserialize)]
pub struct StepQuery {
    /// Filter on the active flag.
    pub active: Option<bool>,
    /// 1-based page.
    pub page: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
}

/// `GET /projects/{project_id}/steps`
pub async fn list_steps(
    State(state): State<ApiState>,
    Path(project_id): Path<String>,
    Query(query): Query<StepQuery>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    let steps = handle
        .steps
        .list(
            &project_id,
            &StepFilter {
                active: query.active,
                page: query.page,
                limit: query.limit,
            },
        )
        .await?;
    Ok(envelope(steps))
}

/// `GET /projects/{project_id}/steps/{step_id}`
pub async fn get_step(
    State(state): State<ApiState>,
    Path((project_id, step_id)): Path<(String, i64)>,
) -> ApiResult<impl IntoResponse> {
    let handle = open(&state, &project_id).await?;
    let _lease = handle.read_lease().await;
    let step = handle.steps.get(step_id).await?;
    if step.project_id != project_id {
        return Err(ApiError::from(crate::error::CoreError::not_found(
            "step", step_id,
        )));
    }
    Ok(envelope(step))
}
