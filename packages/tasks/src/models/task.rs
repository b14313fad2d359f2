//! Task model: one persisted unit of queued work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgExecutor};

use super::{JsonObject, ScheduleId, TaskId};
use crate::error::{Result, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_outcome", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    /// The handler returned an error, panicked, or has no registration
    Failed,
    /// The handler did not return before its deadline
    TimedOut,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Failed => "failed",
            TaskOutcome::TimedOut => "timed_out",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub arguments: Json<JsonObject>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
    pub error_message: Option<String>,
    pub from_schedule_id: Option<ScheduleId>,
}

impl Task {
    pub fn is_pending(&self) -> bool {
        self.started_at.is_none()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Insert a task that becomes eligible at `run_at`.
    pub async fn insert<'e>(
        name: &str,
        arguments: &JsonObject,
        run_at: DateTime<Utc>,
        from_schedule_id: Option<ScheduleId>,
        db: impl PgExecutor<'e>,
    ) -> Result<Self> {
        let task = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO task (name, arguments, run_at, from_schedule_id)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(Json(arguments))
        .bind(run_at)
        .bind(from_schedule_id)
        .fetch_one(db)
        .await?;

        Ok(task)
    }

    pub async fn find_by_id<'e>(id: TaskId, db: impl PgExecutor<'e>) -> Result<Self> {
        Self::find_optional(id, db)
            .await?
            .ok_or(TaskError::TaskNotFound(id))
    }

    pub async fn find_optional<'e>(id: TaskId, db: impl PgExecutor<'e>) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, Self>("SELECT * FROM task WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?;

        Ok(task)
    }

    /// Claim the next task that is due now.
    pub async fn claim_next<'e>(db: impl PgExecutor<'e>) -> Result<Option<Self>> {
        Self::claim_next_at(Utc::now(), db).await
    }

    /// Claim the oldest unstarted task with `run_at <= now`.
    ///
    /// Rows locked by a concurrent claim are skipped rather than waited on, so
    /// at most one caller ever sees a given task as claimed. The statement
    /// commits `started_at` on its own.
    pub async fn claim_next_at<'e>(
        now: DateTime<Utc>,
        db: impl PgExecutor<'e>,
    ) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, Self>(
            r#"
            WITH next_task AS (
                SELECT id
                FROM task
                WHERE started_at IS NULL AND run_at <= $1
                ORDER BY run_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE task
            SET started_at = clock_timestamp()
            FROM next_task
            WHERE task.id = next_task.id
            RETURNING task.*
            "#,
        )
        .bind(now)
        .fetch_optional(db)
        .await?;

        Ok(task)
    }

    /// Record the outcome of a claimed task.
    ///
    /// Fails with a consistency error when the task was never claimed or has
    /// already finished.
    pub async fn mark_finished(
        id: TaskId,
        outcome: TaskOutcome,
        error_message: Option<&str>,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        let finished = sqlx::query_as::<_, Self>(
            r#"
            UPDATE task
            SET finished_at = clock_timestamp(),
                outcome = $2,
                error_message = $3
            WHERE id = $1
              AND started_at IS NOT NULL
              AND finished_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(outcome)
        .bind(error_message)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(task) = finished {
            return Ok(task);
        }

        match Self::find_optional(id, &mut *conn).await? {
            None => Err(TaskError::TaskNotFound(id)),
            Some(task) if task.started_at.is_none() => Err(TaskError::NotClaimed(id)),
            Some(_) => Err(TaskError::AlreadyFinished(id)),
        }
    }

    /// List tasks by `run_at`. Only unstarted tasks unless `include_started`.
    pub async fn list<'e>(include_started: bool, db: impl PgExecutor<'e>) -> Result<Vec<Self>> {
        let tasks = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM task
            WHERE $1 OR started_at IS NULL
            ORDER BY run_at, id
            "#,
        )
        .bind(include_started)
        .fetch_all(db)
        .await?;

        Ok(tasks)
    }

    /// All tasks produced by a schedule, oldest first.
    pub async fn find_for_schedule<'e>(
        schedule_id: ScheduleId,
        db: impl PgExecutor<'e>,
    ) -> Result<Vec<Self>> {
        let tasks = sqlx::query_as::<_, Self>(
            "SELECT * FROM task WHERE from_schedule_id = $1 ORDER BY run_at, id",
        )
        .bind(schedule_id)
        .fetch_all(db)
        .await?;

        Ok(tasks)
    }

    /// Delete tasks that finished before `cutoff`. Returns the number deleted.
    pub async fn delete_finished_before<'e>(
        cutoff: DateTime<Utc>,
        db: impl PgExecutor<'e>,
    ) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM task WHERE finished_at < $1")
            .bind(cutoff)
            .execute(db)
            .await?
            .rows_affected();

        Ok(deleted)
    }
}
