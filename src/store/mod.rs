//! Embedded SQLite stores for tasks and steps.
//!
//! Each project owns two databases: `tasks.db` (tasks, logs, reviews,
//! work queue) and `steps.db` (numbered step history). Schema is created
//! idempotently at open; all invariant checks live next to the writes
//! that could break them.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{CoreError, CoreResult};

pub mod snapshot;
pub mod steps;
pub mod tasks;

pub use steps::{Step, StepFilter, StepStore};
pub use tasks::{
    NewTask, ReviewFeedback, ReviewStatus, Task, TaskFilter, TaskLog, TaskReview, TaskStatus,
    TaskStore, TaskType, UpdateTaskFields,
};

/// Open (and create if missing) a SQLite database at `path`.
///
/// WAL journal mode for concurrent readers, foreign keys enforced on every
/// connection, busy timeout so writer contention surfaces as a transient
/// error instead of an immediate failure.
pub(crate) async fn open_pool(path: &Path) -> CoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|e| CoreError::Host(format!("invalid database path: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Open an in-memory database sharing one connection (tests, snapshots of nothing).
pub(crate) async fn open_memory_pool() -> CoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| CoreError::Host(format!("invalid memory database: {e}")))?
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Current UTC instant rendered the way the stores persist it.
pub(crate) fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored instant back into a [`DateTime<Utc>`].
pub(crate) fn parse_instant(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Host(format!("corrupt timestamp {raw:?}: {e}")))
}
