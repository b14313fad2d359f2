//! Schedule model: a cron definition that keeps exactly one pending task.
//!
//! An enabled schedule always tracks its next task through `next_task_id`.
//! A disabled schedule keeps pointing at whatever it tracked last.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{Acquire, FromRow, PgConnection, PgExecutor, Postgres};
use tracing::{debug, info, warn};

use super::{JsonObject, ScheduleId, Task, TaskId};
use crate::cron::{self, CronSchedule};
use crate::error::{Result, TaskError};

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: ScheduleId,
    pub name: String,
    pub arguments: Json<JsonObject>,
    pub expression: String,
    pub is_enabled: bool,
    pub next_task_id: Option<TaskId>,
}

impl ScheduledTask {
    /// Create an enabled schedule and queue its first occurrence after now.
    pub async fn create<'a>(
        name: &str,
        arguments: &JsonObject,
        expression: &str,
        db: impl Acquire<'a, Database = Postgres>,
    ) -> Result<Self> {
        let run_at = CronSchedule::parse(expression)?.next_occurrence(Utc::now())?;

        let mut tx = db.begin().await?;

        // Inserted disabled: the enabled check needs next_task_id to exist first
        let schedule_id = sqlx::query_scalar::<_, ScheduleId>(
            r#"
            INSERT INTO scheduled_task (name, arguments, expression, is_enabled)
            VALUES ($1, $2, $3, false)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(Json(arguments))
        .bind(expression)
        .fetch_one(&mut *tx)
        .await?;

        let task = Task::insert(name, arguments, run_at, Some(schedule_id), &mut *tx).await?;

        let schedule = sqlx::query_as::<_, Self>(
            r#"
            UPDATE scheduled_task
            SET next_task_id = $1, is_enabled = true
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(task.id)
        .bind(schedule_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            schedule_id = %schedule.id,
            task_name = %schedule.name,
            expression = %schedule.expression,
            next_run_at = %run_at,
            "created scheduled task"
        );

        Ok(schedule)
    }

    pub async fn find_by_id<'e>(id: ScheduleId, db: impl PgExecutor<'e>) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM scheduled_task WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?
            .ok_or(TaskError::ScheduleNotFound(id))
    }

    pub async fn list<'e>(db: impl PgExecutor<'e>) -> Result<Vec<Self>> {
        let schedules = sqlx::query_as::<_, Self>("SELECT * FROM scheduled_task ORDER BY id")
            .fetch_all(db)
            .await?;

        Ok(schedules)
    }

    async fn lock(id: ScheduleId, conn: &mut PgConnection) -> Result<Option<Self>> {
        let schedule =
            sqlx::query_as::<_, Self>("SELECT * FROM scheduled_task WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;

        Ok(schedule)
    }

    async fn track(&mut self, task: &Task, conn: &mut PgConnection) -> Result<()> {
        sqlx::query("UPDATE scheduled_task SET next_task_id = $1, is_enabled = true WHERE id = $2")
            .bind(task.id)
            .bind(self.id)
            .execute(&mut *conn)
            .await?;

        self.next_task_id = Some(task.id);
        self.is_enabled = true;
        Ok(())
    }

    /// Queue the occurrence that follows a finished task.
    ///
    /// Must run in the transaction that marked `finished` as finished. The next
    /// run is the first cron occurrence after `anchor`. Nothing is queued when
    /// the schedule is disabled, gone, or already tracks a different task.
    pub async fn advance(
        finished: &Task,
        anchor: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Option<Task>> {
        let Some(schedule_id) = finished.from_schedule_id else {
            return Ok(None);
        };

        let Some(mut schedule) = Self::lock(schedule_id, conn).await? else {
            warn!(schedule_id = %schedule_id, task_id = %finished.id, "schedule no longer exists");
            return Ok(None);
        };

        if !schedule.is_enabled {
            debug!(schedule_id = %schedule.id, "schedule disabled, not queueing next task");
            return Ok(None);
        }

        if schedule.next_task_id != Some(finished.id) {
            debug!(
                schedule_id = %schedule.id,
                task_id = %finished.id,
                next_task_id = ?schedule.next_task_id,
                "schedule tracks another task, not queueing next task"
            );
            return Ok(None);
        }

        let run_at = cron::next_occurrence(&schedule.expression, anchor)?;
        let next = Task::insert(
            &schedule.name,
            &schedule.arguments,
            run_at,
            Some(schedule.id),
            &mut *conn,
        )
        .await?;
        schedule.track(&next, conn).await?;

        Ok(Some(next))
    }

    /// Stop producing tasks. An already queued task still runs.
    pub async fn disable<'e>(id: ScheduleId, db: impl PgExecutor<'e>) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE scheduled_task SET is_enabled = false WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(TaskError::ScheduleNotFound(id))
    }

    /// Resume producing tasks.
    ///
    /// Keeps the tracked task if it has not finished yet; otherwise queues a
    /// fresh task at the next occurrence after now. Occurrences missed while
    /// disabled are not caught up.
    pub async fn enable<'a>(
        id: ScheduleId,
        db: impl Acquire<'a, Database = Postgres>,
    ) -> Result<Self> {
        let mut tx = db.begin().await?;

        let mut schedule = Self::lock(id, &mut *tx)
            .await?
            .ok_or(TaskError::ScheduleNotFound(id))?;

        if schedule.is_enabled {
            tx.commit().await?;
            return Ok(schedule);
        }

        let tracked = match schedule.next_task_id {
            Some(task_id) => Task::find_optional(task_id, &mut *tx).await?,
            None => None,
        };

        match tracked {
            Some(task) if !task.is_finished() => {
                schedule.track(&task, &mut *tx).await?;
            }
            _ => {
                let run_at = cron::next_occurrence(&schedule.expression, Utc::now())?;
                let next = Task::insert(
                    &schedule.name,
                    &schedule.arguments,
                    run_at,
                    Some(schedule.id),
                    &mut *tx,
                )
                .await?;
                schedule.track(&next, &mut *tx).await?;
            }
        }

        tx.commit().await?;

        info!(schedule_id = %schedule.id, next_task_id = ?schedule.next_task_id, "enabled schedule");
        Ok(schedule)
    }
}
