use std::time::Duration;

use thiserror::Error;

use crate::models::{ScheduleId, TaskId};

/// Errors raised by the task queue and scheduler.
#[derive(Error, Debug)]
pub enum TaskError {
    /// A second handler was registered under an existing name.
    #[error("task already registered: {0}")]
    DuplicateTask(String),

    /// No handler is registered under the name.
    #[error("no task registered with name: {0}")]
    NotFound(String),

    /// Task arguments must serialize to a JSON object.
    #[error("invalid arguments for task {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// The handler body returned an error or panicked.
    #[error("task {name} failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("task {0} was never claimed")]
    NotClaimed(TaskId),

    #[error("task {0} is already finished")]
    AlreadyFinished(TaskId),

    #[error("task {0} does not exist")]
    TaskNotFound(TaskId),

    #[error("schedule {0} does not exist")]
    ScheduleNotFound(ScheduleId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TaskError {
    /// Whether this error indicates an executor bug rather than a task failure.
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            TaskError::NotClaimed(_) | TaskError::AlreadyFinished(_) | TaskError::TaskNotFound(_)
        )
    }

    /// Whether this error comes from registry setup (duplicate or missing task).
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, TaskError::DuplicateTask(_) | TaskError::NotFound(_))
    }
}

pub type Result<T, E = TaskError> = std::result::Result<T, E>;
