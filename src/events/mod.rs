//! Mutation events and the per-project subscriber hub.

use serde::{Deserialize, Serialize};

pub mod hub;

pub use hub::{SubscriberHub, SubscriberId};

/// Subscription channel a subscriber can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Task creation, mutation, deletion.
    Tasks,
    /// Review creation and feedback.
    Reviews,
    /// Step completion and rollback.
    Steps,
}

/// One event per mutation, named after the changed entity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A task was created, updated, or deleted.
    TaskUpdated(TaskEvent),
    /// A review was created or received feedback.
    ReviewUpdated(ReviewEvent),
    /// A step finished (successfully or not).
    StepCompleted(StepEvent),
    /// A rollback deactivated a suffix of the step history.
    StepsRolledBack(RollbackEvent),
}

impl Event {
    /// The channel this event is delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            Self::TaskUpdated(_) => Channel::Tasks,
            Self::ReviewUpdated(_) => Channel::Reviews,
            Self::StepCompleted(_) | Self::StepsRolledBack(_) => Channel::Steps,
        }
    }
}

/// Payload for task events.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    /// Task id.
    pub task_id: i64,
    /// Task status after the mutation; absent for deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<crate::store::TaskStatus>,
    /// True when the task was deleted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// Payload for review events.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewEvent {
    /// Review id.
    pub review_id: i64,
    /// Owning task id.
    pub task_id: i64,
    /// Review status after the mutation.
    pub status: crate::store::ReviewStatus,
}

/// Payload for step-completion events.
#[derive(Debug, Clone, Serialize)]
pub struct StepEvent {
    /// Step id.
    pub step_id: i64,
    /// Exit code recorded on the step.
    pub exit_code: Option<i64>,
    /// Whether the step branch was merged into the default branch.
    pub merged: bool,
}

/// Payload for rollback events.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackEvent {
    /// Rollback target (first deactivated step).
    pub target_step_id: i64,
    /// Every step id deactivated by this rollback.
    pub deactivated: Vec<i64>,
}
