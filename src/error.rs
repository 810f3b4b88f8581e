//! Core error taxonomy shared by the stores, adapters, orchestrator, and API.
//!
//! Errors are classified by kind, not by origin: the CLI maps kinds to exit
//! codes and the API layer maps them to stable wire codes. Agent non-zero
//! exits are never errors; they are recorded step data.

use std::time::Duration;

/// Process exit code for user errors (bad id, missing project, bad input).
pub const EXIT_USER_ERROR: i32 = 1;
/// Process exit code for operational errors (I/O, container, repository).
pub const EXIT_OPERATIONAL_ERROR: i32 = 2;
/// Process exit code for task/step invariant violations.
pub const EXIT_INVARIANT_VIOLATION: i32 = 3;

/// Errors produced by the task/step engines and their adapters.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A task or step invariant would be violated. No side effects were applied.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind ("project", "task", "review", "step").
        entity: &'static str,
        /// Identifier as given by the caller.
        id: String,
    },

    /// Input failed validation before touching any store.
    #[error("validation error: {0}")]
    Validation(String),

    /// A conflicting operation is in flight or already happened
    /// (running step, merge conflict, replayed rollback, duplicate project).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient failure that survived adapter-level retries.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Host-side operational failure: filesystem, subprocess, container runtime.
    #[error("operational failure: {0}")]
    Host(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Convenience constructor for [`CoreError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map an error kind to the documented CLI exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Invariant(_) => EXIT_INVARIANT_VIOLATION,
            Self::NotFound { .. } | Self::Validation(_) => EXIT_USER_ERROR,
            Self::Conflict(_) | Self::Transient(_) | Self::Host(_) | Self::Cancelled => {
                EXIT_OPERATIONAL_ERROR
            }
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.message().contains("locked") => {
                Self::Transient(err.to_string())
            }
            _ => Self::Host(format!("database error: {err}")),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Host(format!("io error: {err}"))
    }
}

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Backoff schedule for transient retries at the adapter boundary.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(150),
    Duration::from_millis(400),
];

/// Retry `op` on [`CoreError::Transient`] with a bounded backoff.
///
/// Non-transient errors surface immediately. After the schedule is
/// exhausted the last transient error surfaces unchanged.
///
/// # Errors
///
/// Returns the first non-transient error, or the final transient error
/// once retries are exhausted.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    for delay in RETRY_DELAYS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(CoreError::Transient(msg)) => {
                tracing::debug!(error = %msg, ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
    op().await
}
