//! Postgres-backed background task queue and cron scheduler.
//!
//! Handlers are registered by name in a [`TaskRegistry`]. Calling a
//! [`RegisteredTask`] yields an [`Invocation`] that is run inline, deferred
//! to the queue, scheduled for later, or turned into a recurring
//! [`ScheduledTask`]. [`Executor`]s claim due rows with `SKIP LOCKED`, run
//! them and advance the schedules that produced them.

pub mod builtin;
pub mod config;
pub mod context;
pub mod cron;
pub mod error;
pub mod executor;
pub mod invocation;
pub mod models;
pub mod registry;

pub use context::{TaskConnection, TaskContext};
pub use error::{Result, TaskError};
pub use executor::{Executor, ExecutorConfig, PollOutcome};
pub use invocation::Invocation;
pub use models::{JsonObject, ScheduleId, ScheduledTask, Task, TaskId, TaskOutcome};
pub use registry::{RegisteredTask, SharedTaskRegistry, TaskOptions, TaskRegistry};

/// Schema migrations for the `task` and `scheduled_task` tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
