//! Bound task calls.
//!
//! An [`Invocation`] is a registered task plus concrete arguments. It is
//! consumed exactly once by [`run_inline`](Invocation::run_inline),
//! [`defer`](Invocation::defer), [`schedule`](Invocation::schedule) or
//! [`schedule_recurring`](Invocation::schedule_recurring). Dropping it
//! unconsumed logs a warning naming the task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Acquire, PgExecutor, PgPool, Postgres};
use tracing::{debug, info, warn};

use crate::error::{Result, TaskError};
use crate::executor::execute;
use crate::models::{JsonObject, ScheduleId, ScheduledTask, Task, TaskId};
use crate::registry::RegisteredTask;

/// A task call waiting to be run, deferred or scheduled.
#[must_use = "an invocation does nothing unless it is run inline, deferred or scheduled"]
pub struct Invocation<A, R = ()> {
    task: RegisteredTask<A, R>,
    arguments: Option<A>,
}

impl<A, R> Invocation<A, R> {
    pub(crate) fn new(task: RegisteredTask<A, R>, arguments: A) -> Self {
        Self {
            task,
            arguments: Some(arguments),
        }
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn arguments(&self) -> Option<&A> {
        self.arguments.as_ref()
    }

    fn into_parts(mut self) -> (RegisteredTask<A, R>, A) {
        let Some(arguments) = self.arguments.take() else {
            unreachable!("invocation of {} consumed twice", self.task.name());
        };
        (self.task.clone(), arguments)
    }

    /// Execute the handler now, in the caller's task, without a queue row.
    ///
    /// Atomic tasks run in their own transaction which commits only on
    /// success. Handler errors and timeouts are returned to the caller.
    pub async fn run_inline(self, pool: &PgPool) -> Result<R> {
        let (task, arguments) = self.into_parts();
        debug!(task_name = %task.name(), "running task inline");

        let execution = execute(&task, arguments, pool, None).await?;
        let value = execution.result?;

        if let Some(transaction) = execution.transaction {
            transaction.commit().await?;
        }

        Ok(value)
    }
}

impl<A: Serialize, R> Invocation<A, R> {
    /// Queue the task to run as soon as an executor picks it up.
    pub async fn defer<'e>(self, db: impl PgExecutor<'e>) -> Result<TaskId> {
        self.schedule(Utc::now(), db).await
    }

    /// Queue the task to run no earlier than `run_at`.
    pub async fn schedule<'e>(
        self,
        run_at: DateTime<Utc>,
        db: impl PgExecutor<'e>,
    ) -> Result<TaskId> {
        let (task, arguments) = self.into_parts();
        let arguments = to_json_object(task.name(), &arguments)?;

        let queued = Task::insert(task.name(), &arguments, run_at, None, db).await?;

        info!(
            task_id = %queued.id,
            task_name = %queued.name,
            run_at = %queued.run_at,
            "queued task"
        );

        Ok(queued.id)
    }

    /// Create an enabled schedule running the task on a cron expression.
    pub async fn schedule_recurring<'a>(
        self,
        expression: &str,
        db: impl Acquire<'a, Database = Postgres>,
    ) -> Result<ScheduleId> {
        let (task, arguments) = self.into_parts();
        let arguments = to_json_object(task.name(), &arguments)?;

        let schedule = ScheduledTask::create(task.name(), &arguments, expression, db).await?;
        Ok(schedule.id)
    }
}

impl<A, R> Drop for Invocation<A, R> {
    fn drop(&mut self) {
        if self.arguments.is_some() {
            warn!(
                task_name = %self.task.name(),
                "task invocation dropped without being run, deferred or scheduled"
            );
        }
    }
}

impl<A, R> std::fmt::Debug for Invocation<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("name", &self.task.name())
            .field("consumed", &self.arguments.is_none())
            .finish()
    }
}

/// Serialize task arguments, rejecting anything but a JSON object.
pub(crate) fn to_json_object<A: Serialize>(name: &str, arguments: &A) -> Result<JsonObject> {
    let kind = match serde_json::to_value(arguments)? {
        Value::Object(map) => return Ok(map),
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
    };

    Err(TaskError::InvalidArguments {
        name: name.to_string(),
        reason: format!("arguments must serialize to a JSON object, got {}", kind),
    })
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde::Deserialize;
    use sqlx::postgres::PgPoolOptions;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, Registry};

    use super::*;
    use crate::registry::{TaskOptions, TaskRegistry};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Echo {
        msg: String,
    }

    /// Collects the `task_name` field of every WARN event.
    #[derive(Clone, Default)]
    struct WarnCollector {
        task_names: Arc<Mutex<Vec<String>>>,
    }

    impl WarnCollector {
        fn task_names(&self) -> Vec<String> {
            self.task_names.lock().unwrap().clone()
        }
    }

    impl<S: Subscriber> Layer<S> for WarnCollector {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() != Level::WARN {
                return;
            }
            let mut visitor = TaskNameVisitor::default();
            event.record(&mut visitor);
            self.task_names
                .lock()
                .unwrap()
                .push(visitor.task_name.unwrap_or_default());
        }
    }

    #[derive(Default)]
    struct TaskNameVisitor {
        task_name: Option<String>,
    }

    impl Visit for TaskNameVisitor {
        fn record_str(&mut self, field: &Field, value: &str) {
            if field.name() == "task_name" {
                self.task_name = Some(value.to_string());
            }
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "task_name" {
                self.task_name = Some(format!("{:?}", value));
            }
        }
    }

    fn echo_task(options: TaskOptions) -> RegisteredTask<Echo, String> {
        let mut registry = TaskRegistry::new();
        registry
            .register("echo", options, |args: Echo, _ctx| async move {
                anyhow::Ok(args.msg)
            })
            .unwrap()
    }

    #[test]
    fn test_dropped_invocation_warns_once() {
        let collector = WarnCollector::default();
        let _guard = tracing::subscriber::set_default(Registry::default().with(collector.clone()));

        let task = echo_task(TaskOptions::default());
        {
            let _invocation = task.call(Echo { msg: "hi".into() });
        }

        assert_eq!(collector.task_names(), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn test_run_inline_suppresses_warning() {
        let collector = WarnCollector::default();
        let _guard = tracing::subscriber::set_default(Registry::default().with(collector.clone()));

        // Non-atomic handlers that never touch the store do not connect
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let task = echo_task(TaskOptions::builder().atomic(false).build());

        let value = task
            .call(Echo { msg: "hi".into() })
            .run_inline(&pool)
            .await
            .unwrap();

        assert_eq!(value, "hi");
        assert!(collector.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_run_inline_times_out() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();

        let mut registry = TaskRegistry::new();
        let slow = registry
            .register(
                "slow",
                TaskOptions::builder()
                    .atomic(false)
                    .timeout(Some(Duration::from_millis(20)))
                    .build(),
                |_args: JsonObject, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    anyhow::Ok(())
                },
            )
            .unwrap();

        let err = slow.call(JsonObject::new()).run_inline(&pool).await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout { ref name, .. } if name == "slow"));
    }

    #[tokio::test]
    async fn test_run_inline_returns_handler_error() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();

        let mut registry = TaskRegistry::new();
        let failing = registry
            .register(
                "failing",
                TaskOptions::builder().atomic(false).build(),
                |_args: JsonObject, _ctx| async move {
                    Err::<(), _>(anyhow::anyhow!("sensor unreachable"))
                },
            )
            .unwrap();

        let err = failing.call(JsonObject::new()).run_inline(&pool).await.unwrap_err();
        match err {
            TaskError::Handler { name, source } => {
                assert_eq!(name, "failing");
                assert_eq!(source.to_string(), "sensor unreachable");
            }
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[test]
    fn test_arguments_must_be_object() {
        let object = to_json_object("echo", &Echo { msg: "hi".into() }).unwrap();
        assert_eq!(object.get("msg"), Some(&Value::String("hi".into())));

        let err = to_json_object("echo", &vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, TaskError::InvalidArguments { ref reason, .. } if reason.contains("an array")));

        let err = to_json_object("echo", &()).unwrap_err();
        assert!(matches!(err, TaskError::InvalidArguments { ref reason, .. } if reason.contains("null")));
    }
}
