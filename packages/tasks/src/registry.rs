//! Task registry: maps task names to handlers and execution options.
//!
//! The registry is built once at startup and passed explicitly to the
//! [`Executor`](crate::Executor) and to code that creates invocations. Each
//! registration returns a typed [`RegisteredTask`] handle; the executor
//! resolves stored rows by name through [`TaskRegistry::lookup`], which hands
//! back a type-erased handle taking the raw JSON arguments.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = TaskRegistry::new();
//!
//! let refresh = registry.register(
//!     "refresh-sensor",
//!     TaskOptions::builder().timeout(Some(Duration::from_secs(30))).build(),
//!     |args: RefreshSensor, ctx| async move {
//!         let mut conn = ctx.connection().await?;
//!         sensors::refresh(args.sensor_id, &mut *conn).await
//!     },
//! )?;
//!
//! refresh.call(RefreshSensor { sensor_id: 7 }).defer(&pool).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::context::TaskContext;
use crate::error::{Result, TaskError};
use crate::invocation::Invocation;
use crate::models::JsonObject;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a registered task is executed.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TaskOptions {
    /// Run the handler in a store transaction committed only on success
    #[builder(default = true)]
    pub atomic: bool,
    /// Wall-clock limit for the handler; `None` means no limit
    #[builder(default = Some(DEFAULT_TIMEOUT))]
    pub timeout: Option<Duration>,
    /// Anchor schedule advancement on the finish time instead of `run_at`,
    /// skipping occurrences missed while the task was late
    #[builder(default = false)]
    pub allow_skip: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub(crate) type BoxedHandler<A, R> =
    Arc<dyn Fn(A, TaskContext) -> BoxFuture<'static, anyhow::Result<R>> + Send + Sync>;

/// Handle to a registered task. Cheap to clone.
pub struct RegisteredTask<A, R = ()> {
    name: Arc<str>,
    options: TaskOptions,
    pub(crate) handler: BoxedHandler<A, R>,
}

impl<A, R> Clone for RegisteredTask<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            options: self.options.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<A, R> std::fmt::Debug for RegisteredTask<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<A, R> RegisteredTask<A, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Bind arguments. The returned invocation must be run inline, deferred
    /// or scheduled.
    pub fn call(&self, arguments: A) -> Invocation<A, R> {
        Invocation::new(self.clone(), arguments)
    }
}

/// Registry of task handlers keyed by unique name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask<JsonObject>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a handler under `name`.
    ///
    /// Arguments are stored as a JSON object, so `A` must serialize to one
    /// (a struct with named fields or a map). Registering a name twice fails
    /// with [`TaskError::DuplicateTask`].
    pub fn register<A, R, F, Fut>(
        &mut self,
        name: &str,
        options: TaskOptions,
        handler: F,
    ) -> Result<RegisteredTask<A, R>>
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Send + 'static,
        F: Fn(A, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        if self.tasks.contains_key(name) {
            return Err(TaskError::DuplicateTask(name.to_string()));
        }

        let handler = Arc::new(handler);
        let name: Arc<str> = Arc::from(name);

        let typed: BoxedHandler<A, R> = {
            let handler = Arc::clone(&handler);
            Arc::new(move |arguments: A, ctx: TaskContext| handler(arguments, ctx).boxed())
        };

        let erased: BoxedHandler<JsonObject, ()> = {
            let name = Arc::clone(&name);
            Arc::new(move |arguments: JsonObject, ctx: TaskContext| {
                let handler = Arc::clone(&handler);
                let name = Arc::clone(&name);
                async move {
                    let arguments: A = serde_json::from_value(serde_json::Value::Object(arguments))
                        .with_context(|| format!("failed to deserialize arguments for {}", name))?;
                    handler(arguments, ctx).await?;
                    anyhow::Ok(())
                }
                .boxed()
            })
        };

        self.tasks.insert(
            name.to_string(),
            RegisteredTask {
                name: Arc::clone(&name),
                options: options.clone(),
                handler: erased,
            },
        );

        Ok(RegisteredTask {
            name,
            options,
            handler: typed,
        })
    }

    /// Find a task by name, taking raw JSON arguments.
    pub fn lookup(&self, name: &str) -> Result<RegisteredTask<JsonObject>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Registry shared between executors.
pub type SharedTaskRegistry = Arc<TaskRegistry>;
