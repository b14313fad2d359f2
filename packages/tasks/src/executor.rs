//! Executor: claims queued tasks and runs them through the registry.
//!
//! ```text
//! Executor::run_next
//!     │
//!     ├─► Task::claim_next        (SKIP LOCKED, commits started_at)
//!     ├─► TaskRegistry::lookup    (unknown name = permanent failure)
//!     ├─► execute                 (transaction, deadline, panic guard)
//!     └─► record                  (mark_finished + ScheduledTask::advance)
//! ```
//!
//! Atomic successes record their outcome inside the handler's transaction.
//! Every other path rolls the handler's work back first and records the
//! outcome in a fresh transaction, so a failed occurrence still advances its
//! schedule.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::context::TaskContext;
use crate::error::{Result, TaskError};
use crate::models::{ScheduledTask, Task, TaskId, TaskOutcome};
use crate::registry::{RegisteredTask, SharedTaskRegistry};

/// Configuration for an executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identifies this executor in logs
    pub worker_id: String,
    /// First wait after an empty poll
    pub min_poll_interval: Duration,
    /// Upper bound for the doubling wait between empty polls
    pub max_poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(1),
        }
    }
}

impl ExecutorConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    fn next_poll_interval(&self, current: Duration) -> Duration {
        (current * 2).clamp(self.min_poll_interval, self.max_poll_interval)
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No task was due
    Empty,
    Finished { task_id: TaskId, outcome: TaskOutcome },
}

/// A handler run, with the transaction still open when it succeeded.
pub(crate) struct Execution<R> {
    pub(crate) result: Result<R>,
    pub(crate) transaction: Option<Transaction<'static, Postgres>>,
}

/// Run a handler with the task's execution options applied.
///
/// Atomic tasks get a transaction that is rolled back on error, timeout or
/// panic and handed back open on success. The outer error covers failing to
/// begin that transaction; the handler's own failure is in
/// [`Execution::result`].
pub(crate) async fn execute<A, R>(
    task: &RegisteredTask<A, R>,
    arguments: A,
    pool: &PgPool,
    task_id: Option<TaskId>,
) -> Result<Execution<R>> {
    let name = task.name().to_string();
    let options = task.options();

    let mut ctx = TaskContext::new(pool.clone(), task_id);
    let shared = if options.atomic {
        let transaction = Arc::new(Mutex::new(pool.begin().await?));
        ctx = ctx.with_transaction(Arc::clone(&transaction));
        Some(transaction)
    } else {
        None
    };

    let handler = AssertUnwindSafe((task.handler)(arguments, ctx)).catch_unwind();
    let finished = match options.timeout {
        Some(timeout) => tokio::time::timeout(timeout, handler).await.ok(),
        None => Some(handler.await),
    };

    let mut result = match finished {
        None => Err(TaskError::Timeout {
            name: name.clone(),
            timeout: options.timeout.unwrap_or_default(),
        }),
        Some(Err(panic)) => Err(TaskError::Handler {
            name: name.clone(),
            source: anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
        }),
        Some(Ok(Err(source))) => Err(TaskError::Handler {
            name: name.clone(),
            source,
        }),
        Some(Ok(Ok(value))) => Ok(value),
    };

    let Some(shared) = shared else {
        return Ok(Execution {
            result,
            transaction: None,
        });
    };

    // The handler future has been dropped; a context clone kept alive past
    // it (e.g. moved into a spawned task) still pins the transaction.
    let transaction = match Arc::try_unwrap(shared) {
        Ok(mutex) => Some(mutex.into_inner()),
        Err(_) => {
            warn!(task_name = %name, "task transaction still referenced after handler returned");
            if result.is_ok() {
                result = Err(TaskError::Handler {
                    name: name.clone(),
                    source: anyhow::anyhow!("task context outlived the handler"),
                });
            }
            None
        }
    };

    match (result, transaction) {
        (Ok(value), transaction) => Ok(Execution {
            result: Ok(value),
            transaction,
        }),
        (Err(err), transaction) => {
            if let Some(transaction) = transaction {
                if let Err(rollback) = transaction.rollback().await {
                    warn!(task_name = %name, error = %rollback, "failed to roll back task transaction");
                }
            }
            Ok(Execution {
                result: Err(err),
                transaction: None,
            })
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Worker that claims tasks from the queue and executes them.
///
/// Several executors, in one process or many, can share a store; the claim
/// query guarantees each task is executed by exactly one of them.
pub struct Executor {
    pool: PgPool,
    registry: SharedTaskRegistry,
    config: ExecutorConfig,
    shutdown: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(pool: PgPool, registry: SharedTaskRegistry) -> Self {
        Self::with_config(pool, registry, ExecutorConfig::default())
    }

    /// Create with custom configuration.
    pub fn with_config(pool: PgPool, registry: SharedTaskRegistry, config: ExecutorConfig) -> Self {
        Self {
            pool,
            registry,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Get a shutdown handle for graceful shutdown.
    ///
    /// Call `store(true, Ordering::SeqCst)` on the returned Arc to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Request shutdown. The loop exits after the current cycle.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run one poll cycle: claim a due task, execute it and record the outcome.
    ///
    /// Handler failures are recorded on the task and never returned here.
    /// Errors are store failures or consistency errors.
    pub async fn run_next(&self) -> Result<PollOutcome> {
        let Some(task) = Task::claim_next(&self.pool).await? else {
            return Ok(PollOutcome::Empty);
        };

        let span = info_span!(
            "task",
            task_id = %task.id,
            task_name = %task.name,
            worker_id = %self.config.worker_id,
        );

        self.process(task).instrument(span).await
    }

    async fn process(&self, task: Task) -> Result<PollOutcome> {
        debug!(run_at = %task.run_at, "claimed task");

        let registered = match self.registry.lookup(&task.name) {
            Ok(registered) => registered,
            Err(err) => {
                error!(error = %err, "claimed task has no registered handler");
                let tx = self.pool.begin().await?;
                finish(tx, &task, TaskOutcome::Failed, Some(&err.to_string()), false).await?;
                return Ok(PollOutcome::Finished {
                    task_id: task.id,
                    outcome: TaskOutcome::Failed,
                });
            }
        };

        let execution = match execute(
            &registered,
            task.arguments.0.clone(),
            &self.pool,
            Some(task.id),
        )
        .await
        {
            Ok(execution) => execution,
            Err(err) => {
                error!(error = %err, "could not start task transaction");
                Execution {
                    result: Err(err),
                    transaction: None,
                }
            }
        };

        let (outcome, error_message) = match &execution.result {
            Ok(()) => {
                info!("task succeeded");
                (TaskOutcome::Succeeded, None)
            }
            Err(err @ TaskError::Timeout { .. }) => {
                warn!(error = %err, "task timed out");
                (TaskOutcome::TimedOut, Some(err.to_string()))
            }
            Err(TaskError::Handler { source, .. }) => {
                let message = format!("{source:#}");
                warn!(error = %message, "task failed");
                (TaskOutcome::Failed, Some(message))
            }
            Err(err) => {
                warn!(error = %err, "task failed");
                (TaskOutcome::Failed, Some(err.to_string()))
            }
        };

        let allow_skip = registered.options().allow_skip;

        let Some(tx) = execution.transaction else {
            let tx = self.pool.begin().await?;
            finish(tx, &task, outcome, error_message.as_deref(), allow_skip).await?;
            return Ok(PollOutcome::Finished {
                task_id: task.id,
                outcome,
            });
        };

        // Atomic success: a failure here also discards the handler's writes
        if let Err(err) = finish(tx, &task, outcome, error_message.as_deref(), allow_skip).await {
            if err.is_consistency_error() {
                return Err(err);
            }
            error!(error = %err, "could not commit task transaction");

            let message = format!("failed to commit task transaction: {err}");
            let tx = self.pool.begin().await?;
            finish(tx, &task, TaskOutcome::Failed, Some(&message), allow_skip).await?;
            return Ok(PollOutcome::Finished {
                task_id: task.id,
                outcome: TaskOutcome::Failed,
            });
        }

        Ok(PollOutcome::Finished {
            task_id: task.id,
            outcome,
        })
    }

    /// Run poll cycles until shutdown is requested.
    ///
    /// The wait after an empty poll doubles from `min_poll_interval` up to
    /// `max_poll_interval` and resets once a task is found.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            min_poll_interval_ms = self.config.min_poll_interval.as_millis() as u64,
            max_poll_interval_ms = self.config.max_poll_interval.as_millis() as u64,
            "executor starting"
        );

        let mut wait = self.config.min_poll_interval;

        while !self.is_shutdown_requested() {
            match self.run_next().await {
                Ok(PollOutcome::Finished { .. }) => {
                    wait = self.config.min_poll_interval;
                }
                Ok(PollOutcome::Empty) => {
                    tokio::time::sleep(wait).await;
                    wait = self.config.next_poll_interval(wait);
                }
                Err(err) if err.is_consistency_error() => {
                    error!(worker_id = %self.config.worker_id, error = %err, "executor consistency error");
                }
                Err(err) => {
                    error!(worker_id = %self.config.worker_id, error = %err, "poll cycle failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "executor stopped");
        Ok(())
    }

    /// Run `num_workers` concurrent loops sharing this executor's pool,
    /// registry and shutdown flag. Each cycle uses its own transaction.
    pub async fn run_workers(self: Arc<Self>, num_workers: usize) -> Result<()> {
        let mut handles = Vec::with_capacity(num_workers);

        for index in 0..num_workers.max(1) {
            let worker = Executor {
                pool: self.pool.clone(),
                registry: Arc::clone(&self.registry),
                config: ExecutorConfig {
                    worker_id: format!("{}-{}", self.config.worker_id, index),
                    ..self.config.clone()
                },
                shutdown: Arc::clone(&self.shutdown),
            };
            handles.push(tokio::spawn(async move { worker.run().await }));
        }

        for handle in handles {
            match handle.await {
                Ok(result) => result?,
                Err(err) => error!(error = %err, "executor worker panicked"),
            }
        }

        Ok(())
    }

    /// Run until a shutdown signal is received.
    ///
    /// Convenience method that listens for Ctrl+C.
    pub async fn run_until_shutdown(self: Arc<Self>, num_workers: usize) -> Result<()> {
        let shutdown = self.shutdown_handle();

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run_workers(num_workers).await
    }
}

/// Record the outcome in `tx` and commit it.
async fn finish(
    mut tx: Transaction<'static, Postgres>,
    task: &Task,
    outcome: TaskOutcome,
    error_message: Option<&str>,
    allow_skip: bool,
) -> Result<()> {
    record(task, outcome, error_message, allow_skip, &mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Mark a task finished and advance the schedule that produced it.
///
/// A schedule whose expression no longer parses is disabled, so it never
/// stays enabled without a pending task.
async fn record(
    task: &Task,
    outcome: TaskOutcome,
    error_message: Option<&str>,
    allow_skip: bool,
    conn: &mut PgConnection,
) -> Result<()> {
    let finished = Task::mark_finished(task.id, outcome, error_message, &mut *conn).await?;

    let anchor = if allow_skip {
        finished.finished_at.unwrap_or_else(Utc::now)
    } else {
        finished.run_at
    };

    match ScheduledTask::advance(&finished, anchor, conn).await {
        Ok(Some(next)) => {
            info!(
                schedule_id = ?next.from_schedule_id,
                next_task_id = %next.id,
                next_run_at = %next.run_at,
                "queued next scheduled task"
            );
        }
        Ok(None) => {}
        Err(err @ TaskError::InvalidExpression { .. }) => {
            if let Some(schedule_id) = finished.from_schedule_id {
                ScheduledTask::disable(schedule_id, &mut *conn).await?;
            }
            error!(
                schedule_id = ?finished.from_schedule_id,
                error = %err,
                "could not advance schedule, disabled it"
            );
        }
        Err(err) => return Err(err),
    }

    Ok(())
}
