//! Task store: hierarchical tasks, logs, reviews, and the work queue.
//!
//! Every write enforces the task invariants in the same transaction that
//! performs the mutation, so no observer can see a state that violates
//! them:
//!
//! - completion requires every child completed, no pending review, and
//!   (when the task demands review) at least one approved review
//! - entering in-progress requires the upstream dependency completed
//! - parent and upstream references may not form cycles
//! - creating a review moves the task to in-review atomically

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::{now_utc, open_memory_pool, open_pool, parse_instant};
use crate::error::{CoreError, CoreResult};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not yet started.
    #[serde(rename = "todo")]
    Todo,
    /// Being worked on.
    #[serde(rename = "in-progress")]
    InProgress,
    /// Waiting on human review.
    #[serde(rename = "in-review")]
    InReview,
    /// Done.
    #[serde(rename = "completed")]
    Completed,
}

impl TaskStatus {
    /// Stable wire/storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::InReview => "in-review",
            Self::Completed => "completed",
        }
    }

    /// Parse the storage form back; unknown values are a validation error.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        match raw {
            "todo" => Ok(Self::Todo),
            "in-progress" => Ok(Self::InProgress),
            "in-review" => Ok(Self::InReview),
            "completed" => Ok(Self::Completed),
            other => Err(CoreError::Validation(format!("unknown task status {other:?}"))),
        }
    }
}

/// Task type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum TaskType {
    Epic,
    Feat,
    Bug,
    Plan,
    Doc,
    Arch,
    Design,
    Test,
}

impl TaskType {
    /// Stable wire/storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Epic => "EPIC",
            Self::Feat => "FEAT",
            Self::Bug => "BUG",
            Self::Plan => "PLAN",
            Self::Doc => "DOC",
            Self::Arch => "ARCH",
            Self::Design => "DESIGN",
            Self::Test => "TEST",
        }
    }

    /// Parse the storage form back; unknown values are a validation error.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        match raw {
            "EPIC" => Ok(Self::Epic),
            "FEAT" => Ok(Self::Feat),
            "BUG" => Ok(Self::Bug),
            "PLAN" => Ok(Self::Plan),
            "DOC" => Ok(Self::Doc),
            "ARCH" => Ok(Self::Arch),
            "DESIGN" => Ok(Self::Design),
            "TEST" => Ok(Self::Test),
            other => Err(CoreError::Validation(format!("unknown task type {other:?}"))),
        }
    }
}

/// Review status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    /// Stable wire/storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse the storage form back; unknown values are a validation error.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(CoreError::Validation(format!(
                "unknown review status {other:?}"
            ))),
        }
    }
}

/// A task row, with optional expanded relations for API reads.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Monotonic integer id, rendered as `T{id}`.
    pub id: i64,
    /// Short title.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// What "done" means for this task.
    pub acceptance_criteria: String,
    /// Type tag.
    pub task_type: TaskType,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Parent task id, when part of a hierarchy.
    pub parent_id: Option<i64>,
    /// Upstream dependency that must complete before this task starts.
    pub upstream_id: Option<i64>,
    /// Whether completion requires an approved review.
    pub review_required: bool,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
    /// Completion instant, once completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Child tasks (populated only when expansion was requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Task>>,
    /// Log entries (populated only when expansion was requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<TaskLog>>,
    /// Reviews (populated only when expansion was requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviews: Option<Vec<TaskReview>>,
}

impl Task {
    /// Human-facing id, `T{id}`.
    pub fn display_id(&self) -> String {
        format!("T{}", self.id)
    }
}

/// Append-only task log entry.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLog {
    /// Log entry id.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// Message text.
    pub message: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// A human-gated review checkpoint attached to a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReview {
    /// Review id.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// What the reviewer is asked to look at.
    pub message: String,
    /// Artifact path relative to the project source root.
    pub attachment_path: Option<String>,
    /// Review status.
    pub status: ReviewStatus,
    /// Reviewer feedback text.
    pub feedback: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    /// Short title (required).
    pub title: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// What "done" means.
    #[serde(default)]
    pub acceptance_criteria: String,
    /// Type tag, defaults to FEAT.
    #[serde(default)]
    pub task_type: Option<TaskType>,
    /// Parent task id.
    #[serde(default)]
    pub parent_id: Option<i64>,
    /// Upstream dependency id.
    #[serde(default)]
    pub upstream_id: Option<i64>,
    /// Whether completion requires an approved review.
    #[serde(default)]
    pub review_required: bool,
}

/// Partial update of task fields (status changes go through
/// [`TaskStore::update_status`]).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTaskFields {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New acceptance criteria.
    pub acceptance_criteria: Option<String>,
    /// New type tag.
    pub task_type: Option<TaskType>,
    /// New review-required flag.
    pub review_required: Option<bool>,
}

/// Outcome of [`TaskStore::set_review_feedback`].
#[derive(Debug, Clone)]
pub struct ReviewFeedback {
    /// The review after the update.
    pub review: TaskReview,
    /// True when this call moved the review from pending to approved.
    /// Plan-document ingestion fires only on this edge.
    pub newly_approved: bool,
}

/// Listing filter for tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match any of these statuses (empty = all).
    pub statuses: Vec<TaskStatus>,
    /// Exact parent match.
    pub parent_id: Option<i64>,
    /// Exact type match.
    pub task_type: Option<TaskType>,
    /// 1-based page.
    pub page: Option<u32>,
    /// Page size, capped at [`MAX_PAGE_LIMIT`].
    pub limit: Option<u32>,
}

/// Hard cap on list page sizes.
pub const MAX_PAGE_LIMIT: u32 = 100;
/// Default list page size.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Guard against corrupt parent/upstream chains when walking for cycles.
const MAX_CHAIN_DEPTH: u32 = 10_000;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id                  INTEGER PRIMARY KEY,
    title               TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    acceptance_criteria TEXT NOT NULL DEFAULT '',
    task_type           TEXT NOT NULL DEFAULT 'FEAT',
    status              TEXT NOT NULL DEFAULT 'todo',
    parent_id           INTEGER REFERENCES tasks(id) ON DELETE CASCADE,
    upstream_id         INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
    review_required     INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    completed_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_upstream ON tasks(upstream_id);

CREATE TABLE IF NOT EXISTS task_logs (
    id         INTEGER PRIMARY KEY,
    task_id    INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);

CREATE TABLE IF NOT EXISTS task_reviews (
    id              INTEGER PRIMARY KEY,
    task_id         INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    message         TEXT NOT NULL,
    attachment_path TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    feedback        TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_reviews_task ON task_reviews(task_id);
CREATE INDEX IF NOT EXISTS idx_task_reviews_status ON task_reviews(status);

CREATE TABLE IF NOT EXISTS work_queue (
    task_id   INTEGER PRIMARY KEY REFERENCES tasks(id) ON DELETE CASCADE,
    queued_at TEXT NOT NULL
);
";

/// CRUD plus invariant enforcement for tasks, logs, reviews, and the queue.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open the store at `path`, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the database cannot be opened or migrated.
    pub async fn open(path: &std::path::Path) -> CoreResult<Self> {
        let pool = open_pool(path).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns an error when the schema cannot be created.
    pub async fn open_in_memory() -> CoreResult<Self> {
        let pool = open_memory_pool().await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool (snapshot copy needs raw access).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Task CRUD ───────────────────────────────────────────────

    /// Add a task with just a title and optional parent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing parent, `Invariant` for cycles.
    pub async fn add(&self, title: &str, parent_id: Option<i64>) -> CoreResult<i64> {
        self.add_with_details(NewTask {
            title: title.to_owned(),
            parent_id,
            ..NewTask::default()
        })
        .await
    }

    /// Add a task with the full field set.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty title, `NotFound` for missing
    /// parent/upstream references, `Invariant` for reference cycles.
    pub async fn add_with_details(&self, new: NewTask) -> CoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        let id = insert_task(&mut *tx, &new).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure; a missing task is `Ok(None)`.
    pub async fn get(&self, id: i64) -> CoreResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Fetch a task by id, failing when absent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn get_required(&self, id: i64) -> CoreResult<Task> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", id))
    }

    /// List tasks matching `filter`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn list(&self, filter: &TaskFilter) -> CoreResult<Vec<Task>> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM tasks WHERE 1 = 1");
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut separated = qb.separated(", ");
            for status in &filter.statuses {
                separated.push_bind(status.as_str());
            }
            qb.push(")");
        }
        if let Some(parent) = filter.parent_id {
            qb.push(" AND parent_id = ").push_bind(parent);
        }
        if let Some(task_type) = filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type.as_str());
        }
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .min(MAX_PAGE_LIMIT)
            .max(1);
        let page = filter.page.unwrap_or(1).max(1);
        let offset = i64::from(page.saturating_sub(1)).saturating_mul(i64::from(limit));
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Children of a task, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn children(&self, id: i64) -> CoreResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_id = ?1 ORDER BY id ASC")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Update non-status task fields.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn update_fields(&self, id: i64, update: &UpdateTaskFields) -> CoreResult<Task> {
        let mut tx = self.pool.begin().await?;
        let task = require_task(&mut *tx, id).await?;

        let title = update.title.clone().unwrap_or(task.title);
        let description = update.description.clone().unwrap_or(task.description);
        let acceptance = update
            .acceptance_criteria
            .clone()
            .unwrap_or(task.acceptance_criteria);
        let task_type = update.task_type.unwrap_or(task.task_type);
        let review_required = update.review_required.unwrap_or(task.review_required);
        if title.trim().is_empty() {
            return Err(CoreError::Validation("task title must not be empty".into()));
        }

        sqlx::query(
            "UPDATE tasks SET title = ?1, description = ?2, acceptance_criteria = ?3, \
             task_type = ?4, review_required = ?5, updated_at = ?6 WHERE id = ?7",
        )
        .bind(&title)
        .bind(&description)
        .bind(&acceptance)
        .bind(task_type.as_str())
        .bind(review_required)
        .bind(now_utc())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let updated = require_task(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Transition a task to `new_status`, enforcing every status invariant.
    ///
    /// Completion automatically removes the task from the work queue.
    ///
    /// # Errors
    ///
    /// Returns `Invariant` when a gate blocks the transition, `NotFound`
    /// when the task does not exist.
    pub async fn update_status(&self, id: i64, new_status: TaskStatus) -> CoreResult<Task> {
        let mut tx = self.pool.begin().await?;
        let task = require_task(&mut *tx, id).await?;

        gate_status_transition(&mut *tx, &task, new_status).await?;

        let now = now_utc();
        let completed_at = (new_status == TaskStatus::Completed).then(|| now.clone());
        sqlx::query(
            "UPDATE tasks SET status = ?1, updated_at = ?2, \
             completed_at = COALESCE(?3, completed_at) WHERE id = ?4",
        )
        .bind(new_status.as_str())
        .bind(&now)
        .bind(completed_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if new_status == TaskStatus::Completed {
            sqlx::query("DELETE FROM work_queue WHERE task_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let updated = require_task(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Delete a task; logs, reviews, queue entries, and children cascade.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn delete(&self, id: i64) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("task", id));
        }
        Ok(())
    }

    // ── Logs ────────────────────────────────────────────────────

    /// Append a log line to a task.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn append_log(&self, task_id: i64, message: &str) -> CoreResult<TaskLog> {
        let mut tx = self.pool.begin().await?;
        require_task(&mut *tx, task_id).await?;
        let now = now_utc();
        let result = sqlx::query(
            "INSERT INTO task_logs (task_id, message, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(task_id)
        .bind(message)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(TaskLog {
            id: result.last_insert_rowid(),
            task_id,
            message: message.to_owned(),
            created_at: parse_instant(&now)?,
        })
    }

    /// Log entries for a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn logs(&self, task_id: i64) -> CoreResult<Vec<TaskLog>> {
        let rows = sqlx::query("SELECT * FROM task_logs WHERE task_id = ?1 ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    // ── Reviews ─────────────────────────────────────────────────

    /// Create a pending review and move the task to in-review, atomically.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn create_review(
        &self,
        task_id: i64,
        message: &str,
        attachment_path: Option<&str>,
    ) -> CoreResult<TaskReview> {
        let mut tx = self.pool.begin().await?;
        require_task(&mut *tx, task_id).await?;
        let now = now_utc();
        let result = sqlx::query(
            "INSERT INTO task_reviews (task_id, message, attachment_path, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        )
        .bind(task_id)
        .bind(message)
        .bind(attachment_path)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE tasks SET status = 'in-review', updated_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(TaskReview {
            id: result.last_insert_rowid(),
            task_id,
            message: message.to_owned(),
            attachment_path: attachment_path.map(ToOwned::to_owned),
            status: ReviewStatus::Pending,
            feedback: None,
            created_at: parse_instant(&now)?,
            updated_at: parse_instant(&now)?,
        })
    }

    /// Fetch a review by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the review does not exist.
    pub async fn get_review(&self, review_id: i64) -> CoreResult<TaskReview> {
        let row = sqlx::query("SELECT * FROM task_reviews WHERE id = ?1")
            .bind(review_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("review", review_id))?;
        review_from_row(&row)
    }

    /// Reviews for a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn reviews(&self, task_id: i64) -> CoreResult<Vec<TaskReview>> {
        let rows = sqlx::query("SELECT * FROM task_reviews WHERE task_id = ?1 ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(review_from_row).collect()
    }

    /// Apply human feedback to a review.
    ///
    /// The verdict must be approved or rejected; a rejection requires
    /// non-empty feedback. Task status is not changed here. Replays with
    /// identical arguments are idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a pending verdict or empty rejection
    /// feedback, `NotFound` for a missing review.
    pub async fn set_review_feedback(
        &self,
        review_id: i64,
        verdict: ReviewStatus,
        feedback: Option<&str>,
    ) -> CoreResult<ReviewFeedback> {
        if verdict == ReviewStatus::Pending {
            return Err(CoreError::Validation(
                "review feedback verdict must be approved or rejected".into(),
            ));
        }
        if verdict == ReviewStatus::Rejected && feedback.is_none_or(|f| f.trim().is_empty()) {
            return Err(CoreError::Validation(
                "rejecting a review requires feedback".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM task_reviews WHERE id = ?1")
            .bind(review_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("review", review_id))?;
        let before = review_from_row(&row)?;

        sqlx::query(
            "UPDATE task_reviews SET status = ?1, feedback = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(verdict.as_str())
        .bind(feedback)
        .bind(now_utc())
        .bind(review_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM task_reviews WHERE id = ?1")
            .bind(review_id)
            .fetch_one(&mut *tx)
            .await?;
        let review = review_from_row(&row)?;
        tx.commit().await?;

        Ok(ReviewFeedback {
            newly_approved: before.status == ReviewStatus::Pending
                && review.status == ReviewStatus::Approved,
            review,
        })
    }

    // ── Work queue ──────────────────────────────────────────────

    /// Put a task on the work queue (at most one entry per task).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn enqueue(&self, task_id: i64) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        require_task(&mut *tx, task_id).await?;
        sqlx::query("INSERT OR IGNORE INTO work_queue (task_id, queued_at) VALUES (?1, ?2)")
            .bind(task_id)
            .bind(now_utc())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a task from the work queue (no-op when absent).
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn dequeue(&self, task_id: i64) -> CoreResult<()> {
        sqlx::query("DELETE FROM work_queue WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The next ready task, or `None` when nothing qualifies.
    ///
    /// Candidates are queued tasks in a workable status with no pending
    /// reviews and a satisfied (or absent) upstream dependency. Tasks with
    /// a parent win over parentless tasks; the smallest id wins within the
    /// partition. Stale queue entries for completed tasks are removed.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn next_ready(&self) -> CoreResult<Option<Task>> {
        let mut tx = self.pool.begin().await?;
        // Completed tasks are dequeued lazily, on the next read.
        sqlx::query(
            "DELETE FROM work_queue WHERE task_id IN \
             (SELECT id FROM tasks WHERE status = 'completed')",
        )
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            "SELECT t.* FROM tasks t \
             JOIN work_queue q ON q.task_id = t.id \
             WHERE t.status IN ('todo', 'in-progress', 'in-review') \
               AND NOT EXISTS (SELECT 1 FROM task_reviews r \
                               WHERE r.task_id = t.id AND r.status = 'pending') \
               AND (t.upstream_id IS NULL \
                    OR EXISTS (SELECT 1 FROM tasks u \
                               WHERE u.id = t.upstream_id AND u.status = 'completed')) \
             ORDER BY (t.parent_id IS NULL) ASC, t.id ASC \
             LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let task = row.as_ref().map(task_from_row).transpose()?;
        tx.commit().await?;
        Ok(task)
    }

    // ── Plan-document batches ───────────────────────────────────

    /// Apply a batch of plan upserts atomically.
    ///
    /// Records with an id update the existing task (including parent and
    /// upstream pointers and status); records without an id insert. Any
    /// invariant violation rolls the whole batch back.
    ///
    /// # Errors
    ///
    /// Returns the first violation encountered; the store is unchanged.
    pub async fn apply_plan_batch(&self, records: &[crate::plan::PlanTaskRecord]) -> CoreResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(records.len());
        for record in records {
            let id = apply_plan_record(&mut *tx, record).await?;
            applied.push(id);
        }
        tx.commit().await?;
        Ok(applied)
    }
}

// ── Transaction-scoped helpers ──────────────────────────────────

async fn require_task(conn: &mut SqliteConnection, id: i64) -> CoreResult<Task> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| CoreError::not_found("task", id))?;
    task_from_row(&row)
}

async fn insert_task(conn: &mut SqliteConnection, new: &NewTask) -> CoreResult<i64> {
    if new.title.trim().is_empty() {
        return Err(CoreError::Validation("task title must not be empty".into()));
    }
    if let Some(parent) = new.parent_id {
        require_task(&mut *conn, parent).await.map_err(|_| {
            CoreError::Validation(format!("parent task T{parent} does not exist"))
        })?;
    }
    if let Some(upstream) = new.upstream_id {
        require_task(&mut *conn, upstream).await.map_err(|_| {
            CoreError::Validation(format!("upstream task T{upstream} does not exist"))
        })?;
    }

    let now = now_utc();
    let result = sqlx::query(
        "INSERT INTO tasks (title, description, acceptance_criteria, task_type, status, \
         parent_id, upstream_id, review_required, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'todo', ?5, ?6, ?7, ?8, ?8)",
    )
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.acceptance_criteria)
    .bind(new.task_type.unwrap_or(TaskType::Feat).as_str())
    .bind(new.parent_id)
    .bind(new.upstream_id)
    .bind(new.review_required)
    .bind(&now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Enforce the status-transition invariants for `task` moving to `new_status`.
async fn gate_status_transition(
    conn: &mut SqliteConnection,
    task: &Task,
    new_status: TaskStatus,
) -> CoreResult<()> {
    if new_status == TaskStatus::Completed {
        let incomplete_child: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM tasks WHERE parent_id = ?1 AND status != 'completed' LIMIT 1",
        )
        .bind(task.id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(child) = incomplete_child {
            return Err(CoreError::Invariant(format!(
                "task T{} cannot be completed: child task T{child} is not completed",
                task.id
            )));
        }

        let pending_review: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM task_reviews WHERE task_id = ?1 AND status = 'pending' LIMIT 1",
        )
        .bind(task.id)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(review) = pending_review {
            return Err(CoreError::Invariant(format!(
                "task T{} cannot be completed: review {review} is still pending",
                task.id
            )));
        }

        if task.review_required {
            let approved: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM task_reviews WHERE task_id = ?1 AND status = 'approved' LIMIT 1",
            )
            .bind(task.id)
            .fetch_optional(&mut *conn)
            .await?;
            if approved.is_none() {
                return Err(CoreError::Invariant(format!(
                    "task T{} requires an approved review before completion",
                    task.id
                )));
            }
        }
    }

    if new_status == TaskStatus::InProgress {
        if let Some(upstream) = task.upstream_id {
            let upstream_task = require_task(&mut *conn, upstream).await?;
            if upstream_task.status != TaskStatus::Completed {
                return Err(CoreError::Invariant(format!(
                    "task T{} cannot enter in-progress: upstream dependency T{upstream} is not completed",
                    task.id
                )));
            }
        }
    }

    Ok(())
}

/// Reject parent/upstream edits that would introduce a cycle.
async fn gate_reference_cycle(
    conn: &mut SqliteConnection,
    task_id: i64,
    start: Option<i64>,
    pointer: &str,
) -> CoreResult<()> {
    let mut current = start;
    let mut depth: u32 = 0;
    while let Some(node) = current {
        if node == task_id {
            return Err(CoreError::Invariant(format!(
                "setting {pointer} of T{task_id} to T{} would create a cycle",
                start.unwrap_or(task_id)
            )));
        }
        depth = depth.saturating_add(1);
        if depth > MAX_CHAIN_DEPTH {
            return Err(CoreError::Host(format!(
                "{pointer} chain exceeds {MAX_CHAIN_DEPTH} links; store is corrupt"
            )));
        }
        let column = if pointer == "parent" {
            "SELECT parent_id FROM tasks WHERE id = ?1"
        } else {
            "SELECT upstream_id FROM tasks WHERE id = ?1"
        };
        current = sqlx::query_scalar(column)
            .bind(node)
            .fetch_optional(&mut *conn)
            .await?
            .flatten();
    }
    Ok(())
}

async fn apply_plan_record(
    conn: &mut SqliteConnection,
    record: &crate::plan::PlanTaskRecord,
) -> CoreResult<i64> {
    let status = TaskStatus::parse(&record.status)?;
    let task_type = record
        .task_type
        .as_deref()
        .map(TaskType::parse)
        .transpose()?
        .unwrap_or(TaskType::Feat);

    match record.id {
        Some(id) => {
            let existing = require_task(&mut *conn, id).await?;
            gate_reference_cycle(&mut *conn, id, record.parent_id, "parent").await?;
            gate_reference_cycle(&mut *conn, id, record.upstream_id, "upstream").await?;
            if let Some(parent) = record.parent_id {
                require_task(&mut *conn, parent).await.map_err(|_| {
                    CoreError::Validation(format!("parent task T{parent} does not exist"))
                })?;
            }
            if let Some(upstream) = record.upstream_id {
                require_task(&mut *conn, upstream).await.map_err(|_| {
                    CoreError::Validation(format!("upstream task T{upstream} does not exist"))
                })?;
            }
            if existing.status != status {
                gate_status_transition(&mut *conn, &existing, status).await?;
            }

            let now = now_utc();
            let completed_at = (status == TaskStatus::Completed).then(|| now.clone());
            sqlx::query(
                "UPDATE tasks SET title = ?1, description = ?2, acceptance_criteria = ?3, \
                 task_type = ?4, status = ?5, parent_id = ?6, upstream_id = ?7, \
                 review_required = ?8, updated_at = ?9, \
                 completed_at = COALESCE(?10, completed_at) WHERE id = ?11",
            )
            .bind(&record.title)
            .bind(&record.description)
            .bind(&record.acceptance_criteria)
            .bind(task_type.as_str())
            .bind(status.as_str())
            .bind(record.parent_id)
            .bind(record.upstream_id)
            .bind(record.review_required)
            .bind(&now)
            .bind(completed_at)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            if status == TaskStatus::Completed {
                sqlx::query("DELETE FROM work_queue WHERE task_id = ?1")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(id)
        }
        None => {
            let id = insert_task(
                &mut *conn,
                &NewTask {
                    title: record.title.clone(),
                    description: record.description.clone(),
                    acceptance_criteria: record.acceptance_criteria.clone(),
                    task_type: Some(task_type),
                    parent_id: record.parent_id,
                    upstream_id: record.upstream_id,
                    review_required: record.review_required,
                },
            )
            .await?;
            if status != TaskStatus::Todo {
                let task = require_task(&mut *conn, id).await?;
                gate_status_transition(&mut *conn, &task, status).await?;
                sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(status.as_str())
                    .bind(now_utc())
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }
            Ok(id)
        }
    }
}

// ── Row mapping ─────────────────────────────────────────────────

fn task_from_row(row: &SqliteRow) -> CoreResult<Task> {
    let status: String = row.try_get("status")?;
    let task_type: String = row.try_get("task_type")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        acceptance_criteria: row.try_get("acceptance_criteria")?,
        task_type: TaskType::parse(&task_type)?,
        status: TaskStatus::parse(&status)?,
        parent_id: row.try_get("parent_id")?,
        upstream_id: row.try_get("upstream_id")?,
        review_required: row.try_get("review_required")?,
        created_at: parse_instant(&created_at)?,
        updated_at: parse_instant(&updated_at)?,
        completed_at: completed_at.as_deref().map(parse_instant).transpose()?,
        children: None,
        logs: None,
        reviews: None,
    })
}

fn log_from_row(row: &SqliteRow) -> CoreResult<TaskLog> {
    let created_at: String = row.try_get("created_at")?;
    Ok(TaskLog {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        message: row.try_get("message")?,
        created_at: parse_instant(&created_at)?,
    })
}

fn review_from_row(row: &SqliteRow) -> CoreResult<TaskReview> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(TaskReview {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        message: row.try_get("message")?,
        attachment_path: row.try_get("attachment_path")?,
        status: ReviewStatus::parse(&status)?,
        feedback: row.try_get("feedback")?,
        created_at: parse_instant(&created_at)?,
        updated_at: parse_instant(&updated_at)?,
    })
}
