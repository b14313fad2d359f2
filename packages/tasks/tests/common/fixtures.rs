//! Shared task handlers and row helpers for integration tests.

use chrono::{DateTime, Utc};
use heim_tasks::{JsonObject, RegisteredTask, TaskId, TaskOptions, TaskRegistry};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub value: i32,
}

pub fn echo_args(msg: &str) -> JsonObject {
    let mut arguments = JsonObject::new();
    arguments.insert("msg".to_string(), serde_json::Value::String(msg.to_string()));
    arguments
}

/// Register `echo`, which returns its message.
pub fn register_echo(registry: &mut TaskRegistry) -> RegisteredTask<Echo, String> {
    registry
        .register("echo", TaskOptions::default(), |args: Echo, _ctx| async move {
            anyhow::Ok(args.msg)
        })
        .expect("Failed to register echo")
}

/// Register a task that inserts a reading and then fails if `fail` is set.
pub fn register_record_reading(
    registry: &mut TaskRegistry,
    name: &str,
    options: TaskOptions,
    fail: bool,
) -> RegisteredTask<Reading, i64> {
    registry
        .register(name, options, move |args: Reading, ctx| async move {
            let id = {
                let mut conn = ctx.connection().await?;
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO sensor_reading (value) VALUES ($1) RETURNING id",
                )
                .bind(args.value)
                .fetch_one(&mut *conn)
                .await?
            };

            if fail {
                anyhow::bail!("sensor reading rejected");
            }
            anyhow::Ok(id)
        })
        .expect("Failed to register reading task")
}

pub async fn create_readings_table(pool: &PgPool) {
    sqlx::query("CREATE TABLE sensor_reading (id BIGSERIAL PRIMARY KEY, value INTEGER NOT NULL)")
        .execute(pool)
        .await
        .expect("Failed to create sensor_reading table");
}

pub async fn count_readings(pool: &PgPool) -> i64 {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sensor_reading")
        .fetch_one(pool)
        .await
        .expect("Failed to count readings")
}

pub async fn set_run_at(pool: &PgPool, task_id: TaskId, run_at: DateTime<Utc>) {
    sqlx::query("UPDATE task SET run_at = $1 WHERE id = $2")
        .bind(run_at)
        .bind(task_id)
        .execute(pool)
        .await
        .expect("Failed to update run_at");
}

/// Force a task into the finished state at `finished_at`.
pub async fn set_finished_at(pool: &PgPool, task_id: TaskId, finished_at: DateTime<Utc>) {
    sqlx::query(
        r#"
        UPDATE task
        SET started_at = $1, finished_at = $1, outcome = 'succeeded'
        WHERE id = $2
        "#,
    )
    .bind(finished_at)
    .bind(task_id)
    .execute(pool)
    .await
    .expect("Failed to finish task");
}
