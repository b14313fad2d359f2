//! Task runner and queue administration CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use heim_tasks::builtin::{self, DeleteOldTasks, DELETE_OLD_TASKS, DELETE_OLD_TASKS_EXPRESSION};
use heim_tasks::config::Config;
use heim_tasks::{Executor, PollOutcome, ScheduleId, ScheduledTask, Task, TaskRegistry, MIGRATOR};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "heim-tasks")]
#[command(about = "Background task queue and scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Run executors until Ctrl+C
    Run {
        /// Concurrent executor loops in this process
        #[arg(long)]
        num_workers: Option<usize>,
    },

    /// Run a single poll cycle
    RunOnce,

    /// List pending tasks
    List {
        /// Include started and finished tasks
        #[arg(long)]
        all: bool,
    },

    /// List schedules
    Schedules,

    /// Enable a schedule
    Enable { id: i64 },

    /// Disable a schedule
    Disable { id: i64 },

    /// Schedule the cleanup of old finished tasks
    InstallCleanup {
        #[arg(long, default_value = DELETE_OLD_TASKS_EXPRESSION)]
        expression: String,
    },
}

fn build_registry() -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    builtin::register(&mut registry).context("Failed to register built-in tasks")?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,heim_tasks=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let num_workers = match &cli.command {
        Commands::Run { num_workers } => num_workers.unwrap_or(config.num_workers),
        _ => 1,
    };
    let pool = config.connect(num_workers).await?;

    match cli.command {
        Commands::Migrate => {
            MIGRATOR
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("migrations applied");
        }

        Commands::Run { .. } => {
            let registry = Arc::new(build_registry()?);
            let executor_config = config.executor_config();
            tracing::info!(
                num_workers,
                tasks = ?registry.registered_names(),
                "starting task executors"
            );

            Arc::new(Executor::with_config(pool, registry, executor_config))
                .run_until_shutdown(num_workers)
                .await?;
        }

        Commands::RunOnce => {
            let registry = Arc::new(build_registry()?);
            let executor = Executor::new(pool, registry);

            match executor.run_next().await? {
                PollOutcome::Empty => println!("no task due"),
                PollOutcome::Finished { task_id, outcome } => {
                    println!("task {} finished: {}", task_id, outcome)
                }
            }
        }

        Commands::List { all } => {
            let tasks = Task::list(all, &pool).await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }

        Commands::Schedules => {
            let schedules = ScheduledTask::list(&pool).await?;
            println!("{}", serde_json::to_string_pretty(&schedules)?);
        }

        Commands::Enable { id } => {
            let schedule = ScheduledTask::enable(ScheduleId::from(id), &pool).await?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }

        Commands::Disable { id } => {
            let schedule = ScheduledTask::disable(ScheduleId::from(id), &pool).await?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }

        Commands::InstallCleanup { expression } => {
            let existing = ScheduledTask::list(&pool)
                .await?
                .into_iter()
                .find(|schedule| schedule.name == DELETE_OLD_TASKS);

            if let Some(schedule) = existing {
                println!("{} already scheduled as {}", DELETE_OLD_TASKS, schedule.id);
                return Ok(());
            }

            let mut registry = TaskRegistry::new();
            let cleanup = builtin::register(&mut registry)?;
            let schedule_id = cleanup
                .call(DeleteOldTasks::default())
                .schedule_recurring(&expression, &pool)
                .await?;

            println!("{} scheduled as {}", DELETE_OLD_TASKS, schedule_id);
        }
    }

    Ok(())
}
