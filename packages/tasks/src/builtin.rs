//! Tasks every deployment registers.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::models::Task;
use crate::registry::{RegisteredTask, TaskOptions, TaskRegistry};

pub const DELETE_OLD_TASKS: &str = "delete-old-tasks";

/// Default cron expression for [`DELETE_OLD_TASKS`]: daily at 03:00.
pub const DELETE_OLD_TASKS_EXPRESSION: &str = "0 3 * * *";

/// Finished tasks older than this are deleted.
pub fn retention() -> Duration {
    Duration::days(7)
}

/// Arguments for [`DELETE_OLD_TASKS`]. The task takes none.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeleteOldTasks {}

/// Register the cleanup task that deletes finished tasks past retention.
///
/// Registered with `allow_skip`, so a backlog of missed runs collapses into
/// one.
pub fn register(registry: &mut TaskRegistry) -> Result<RegisteredTask<DeleteOldTasks, u64>> {
    registry.register(
        DELETE_OLD_TASKS,
        TaskOptions::builder().allow_skip(true).build(),
        |_args: DeleteOldTasks, ctx| async move {
            let cutoff = Utc::now() - retention();
            let mut conn = ctx.connection().await?;
            let deleted = Task::delete_finished_before(cutoff, &mut *conn).await?;

            info!(deleted, cutoff = %cutoff, "deleted old tasks");
            anyhow::Ok(deleted)
        },
    )
}
