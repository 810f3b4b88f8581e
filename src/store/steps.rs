//! Step store: the numbered, parent-linked execution history.
//!
//! Step ids are strictly increasing within a project (rows are never
//! deleted, only deactivated), at most one step per project may be running
//! (no finish instant), and rollback flips the `active` flag for a suffix
//! of the history in one transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{now_utc, open_memory_pool, open_pool, parse_instant};
use crate::error::{CoreError, CoreResult};

/// One agent invocation, linking a pre- and post-commit.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    /// Monotonic id, rendered as `S{id}`.
    pub id: i64,
    /// Owning project.
    pub project_id: String,
    /// False once a rollback deactivated this step.
    pub active: bool,
    /// Most recent still-active step at creation time.
    pub parent_step_id: Option<i64>,
    /// Repository head before the step ran.
    pub commit_before: String,
    /// Commit captured from the step's worktree, when changes existed.
    pub commit_after: Option<String>,
    /// Serialized agent profile the step ran with.
    pub agent_config: serde_json::Value,
    /// Start instant.
    pub started_at: DateTime<Utc>,
    /// Finish instant; unset while the step is running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// Container exit code (or a synthetic host-side code).
    pub exit_code: Option<i64>,
    /// Token usage parsed from agent output, when an extractor matched.
    pub token_usage: Option<serde_json::Value>,
    /// Row creation instant.
    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Human-facing id, `S{id}`.
    pub fn display_id(&self) -> String {
        format!("S{}", self.id)
    }

    /// The repository branch this step works on.
    pub fn branch_name(&self) -> String {
        format!("step-S{}", self.id)
    }

    /// True while the step has no finish instant.
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Listing filter for steps.
#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    /// Filter on the active flag.
    pub active: Option<bool>,
    /// 1-based page.
    pub page: Option<u32>,
    /// Page size, capped.
    pub limit: Option<u32>,
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS steps (
    id             INTEGER PRIMARY KEY,
    project_id     TEXT NOT NULL,
    active         INTEGER NOT NULL DEFAULT 1,
    parent_step_id INTEGER REFERENCES steps(id),
    commit_before  TEXT NOT NULL,
    commit_after   TEXT,
    agent_config   TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    finished_at    TEXT,
    duration_ms    INTEGER,
    exit_code      INTEGER,
    token_usage    TEXT,
    created_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_project ON steps(project_id);
CREATE INDEX IF NOT EXISTS idx_steps_active ON steps(project_id, active);
CREATE INDEX IF NOT EXISTS idx_steps_created ON steps(created_at);
CREATE INDEX IF NOT EXISTS idx_steps_parent ON steps(parent_step_id);
";

/// CRUD plus invariant enforcement for the step history.
#[derive(Debug, Clone)]
pub struct StepStore {
    pool: SqlitePool,
}

impl StepStore {
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

    /// Record a step starting now.
    ///
    /// `parent_step_id` should be the latest active step (or `None` for
    /// the first). Only one step per project may be running.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when another step is still running and
    /// `Validation` when the parent reference is not an extant step of
    /// the same project.
    pub async fn begin_step(
        &self,
        project_id: &str,
        parent_step_id: Option<i64>,
        commit_before: &str,
        agent_config: &serde_json::Value,
    ) -> CoreResult<Step> {
        let mut tx = self.pool.begin().await?;

        let running: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM steps WHERE project_id = ?1 AND finished_at IS NULL LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = running {
            return Err(CoreError::Conflict(format!(
                "step S{id} is already running for project {project_id}"
            )));
        }

        if let Some(parent) = parent_step_id {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM steps WHERE id = ?1 AND project_id = ?2",
            )
            .bind(parent)
            .bind(project_id)
            .fetch_optional(&mut *tx)
            .await?;
            if exists.is_none() {
                return Err(CoreError::Validation(format!(
                    "parent step S{parent} does not exist in project {project_id}"
                )));
            }
        }

        let now = now_utc();
        let config_json = agent_config.to_string();
        let result = sqlx::query(
            "INSERT INTO steps (project_id, active, parent_step_id, commit_before, \
             agent_config, started_at, created_at) VALUES (?1, 1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(project_id)
        .bind(parent_step_id)
        .bind(commit_before)
        .bind(&config_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        let row = sqlx::query("SELECT * FROM steps WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let step = step_from_row(&row)?;
        tx.commit().await?;
        Ok(step)
    }

    /// Finalize a step that ran to the end of its lifecycle.
    ///
    /// `commit_after` stays unset when the step produced no changes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing step, `Conflict` for one already
    /// finished.
    pub async fn finish_step(
        &self,
        id: i64,
        commit_after: Option<&str>,
        exit_code: i64,
        token_usage: Option<&serde_json::Value>,
    ) -> CoreResult<Step> {
        self.finalize(id, commit_after, exit_code, token_usage).await
    }

    /// Mark a step failed; `commit_after` is left unset.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing step, `Conflict` for one already
    /// finished.
    pub async fn fail_step(&self, id: i64, exit_code: i64) -> CoreResult<Step> {
        self.finalize(id, None, exit_code, None).await
    }

    async fn finalize(
        &self,
        id: i64,
        commit_after: Option<&str>,
        exit_code: i64,
        token_usage: Option<&serde_json::Value>,
    ) -> CoreResult<Step> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("step", id))?;
        let step = step_from_row(&row)?;
        if !step.is_running() {
            return Err(CoreError::Conflict(format!(
                "step S{id} is already finished"
            )));
        }

        let now = now_utc();
        let finished = parse_instant(&now)?;
        let duration_ms = finished
            .signed_duration_since(step.started_at)
            .num_milliseconds()
            .max(0);
        sqlx::query(
            "UPDATE steps SET commit_after = ?1, finished_at = ?2, duration_ms = ?3, \
             exit_code = ?4, token_usage = ?5 WHERE id = ?6",
        )
        .bind(commit_after)
        .bind(&now)
        .bind(duration_ms)
        .bind(exit_code)
        .bind(token_usage.map(serde_json::Value::to_string))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT * FROM steps WHERE id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let updated = step_from_row(&row)?;
        tx.commit().await?;
        Ok(updated)
    }

    /// The most recent active step of a project, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn latest_active(&self, project_id: &str) -> CoreResult<Option<Step>> {
        let row = sqlx::query(
            "SELECT * FROM steps WHERE project_id = ?1 AND active = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    /// The currently running step of a project, if any.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn running(&self, project_id: &str) -> CoreResult<Option<Step>> {
        let row = sqlx::query(
            "SELECT * FROM steps WHERE project_id = ?1 AND finished_at IS NULL LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(step_from_row).transpose()
    }

    /// Fetch a step by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the step does not exist.
    pub async fn get(&self, id: i64) -> CoreResult<Step> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("step", id))?;
        step_from_row(&row)
    }

    /// List a project's steps, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn list(&self, project_id: &str, filter: &StepFilter) -> CoreResult<Vec<Step>> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM steps WHERE project_id = ");
        qb.push_bind(project_id);
        if let Some(active) = filter.active {
            qb.push(" AND active = ").push_bind(active);
        }
        let limit = filter
            .limit
            .unwrap_or(super::tasks::DEFAULT_PAGE_LIMIT)
            .min(super::tasks::MAX_PAGE_LIMIT)
            .max(1);
        let page = filter.page.unwrap_or(1).max(1);
        let offset = i64::from(page.saturating_sub(1)).saturating_mul(i64::from(limit));
        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(step_from_row).collect()
    }

    /// Deactivate every step with id ≥ `from_id` in one transaction.
    ///
    /// Returns the ids that were flipped from active to inactive.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn deactivate_from(&self, project_id: &str, from_id: i64) -> CoreResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM steps WHERE project_id = ?1 AND id >= ?2 AND active = 1 ORDER BY id ASC",
        )
        .bind(project_id)
        .bind(from_id)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("UPDATE steps SET active = 0 WHERE project_id = ?1 AND id >= ?2")
            .bind(project_id)
            .bind(from_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(ids)
    }
}

fn step_from_row(row: &SqliteRow) -> CoreResult<Step> {
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let created_at: String = row.try_get("created_at")?;
    let agent_config: String = row.try_get("agent_config")?;
    let token_usage: Option<String> = row.try_get("token_usage")?;
    Ok(Step {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        active: row.try_get("active")?,
        parent_step_id: row.try_get("parent_step_id")?,
        commit_before: row.try_get("commit_before")?,
        commit_after: row.try_get("commit_after")?,
        agent_config: serde_json::from_str(&agent_config)
            .map_err(|e| CoreError::Host(format!("corrupt agent config: {e}")))?,
        started_at: parse_instant(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_instant).transpose()?,
        duration_ms: row.try_get("duration_ms")?,
        exit_code: row.try_get("exit_code")?,
        token_usage: token_usage
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| CoreError::Host(format!("corrupt token usage: {e}")))?,
        created_at: parse_instant(&created_at)?,
    })
}
