use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::executor::ExecutorConfig;

/// Task runner configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub num_workers: usize,
    pub max_connections: u32,
    /// Longest wait between polls of an empty queue
    pub max_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            num_workers: env::var("TASKS_NUM_WORKERS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("TASKS_NUM_WORKERS must be a valid number")?,
            max_connections: env::var("TASKS_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("TASKS_MAX_CONNECTIONS must be a valid number")?,
            max_poll_interval: Duration::from_millis(
                env::var("TASKS_MAX_POLL_INTERVAL_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .context("TASKS_MAX_POLL_INTERVAL_MS must be a valid number")?,
            ),
        })
    }

    /// Executor settings with the configured backoff ceiling.
    ///
    /// The floor stays at the executor default unless it would exceed the
    /// ceiling.
    pub fn executor_config(&self) -> ExecutorConfig {
        let defaults = ExecutorConfig::default();
        ExecutorConfig {
            min_poll_interval: defaults.min_poll_interval.min(self.max_poll_interval),
            max_poll_interval: self.max_poll_interval,
            ..defaults
        }
    }

    /// Connect a pool sized for `num_workers` executors.
    ///
    /// Each worker can hold a task transaction while claiming with a second
    /// connection, so the pool never shrinks below `num_workers + 1`.
    pub async fn connect(&self, num_workers: usize) -> Result<PgPool> {
        let max_connections = self.max_connections.max(num_workers as u32 + 1);

        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&self.database_url)
            .await
            .context("Failed to connect to database")
    }
}
