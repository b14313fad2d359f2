//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test. Migrations run once into a
//! template database; each test gets its own database cloned from it, so
//! executors in concurrently running tests never claim each other's tasks.

use anyhow::{Context, Result};
use heim_tasks::MIGRATOR;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

const TEMPLATE_DATABASE: &str = "heim_tasks_template";

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    server_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=heim_tasks=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=500"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        let mut admin = PgConnection::connect(&format!("{}/postgres", server_url))
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::query(&format!("CREATE DATABASE {}", TEMPLATE_DATABASE))
            .execute(&mut admin)
            .await
            .context("Failed to create template database")?;
        admin.close().await?;

        // Migrate once; the template must have no open connections when cloned
        let template_pool = PgPool::connect(&format!("{}/{}", server_url, TEMPLATE_DATABASE))
            .await
            .context("Failed to connect to template database")?;
        MIGRATOR
            .run(&template_pool)
            .await
            .context("Failed to run migrations")?;
        template_pool.close().await;

        Ok(Self {
            server_url,
            _postgres: postgres,
        })
    }

    /// A connection to the maintenance database. Pools are tied to the
    /// runtime that created them and every test has its own runtime.
    async fn admin_connection(&self) -> Result<PgConnection> {
        PgConnection::connect(&format!("{}/postgres", self.server_url))
            .await
            .context("Failed to connect to Postgres")
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Test harness owning a freshly migrated database.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let task = Task::claim_next(&ctx.db_pool).await.unwrap();
/// }
/// ```
pub struct TestHarness {
    /// Pool on this test's own database.
    pub db_pool: PgPool,
    pub database_name: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;

        let infra = SharedTestInfra::get().await;
        if let Ok(mut admin) = infra.admin_connection().await {
            let _ = sqlx::query(&format!(
                "DROP DATABASE IF EXISTS {} WITH (FORCE)",
                self.database_name
            ))
            .execute(&mut admin)
            .await;
            let _ = admin.close().await;
        }
    }
}

impl TestHarness {
    /// Clone the migrated template into a new database and connect to it.
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let database_name = format!("heim_tasks_test_{}", Uuid::new_v4().simple());

        let mut admin = infra.admin_connection().await?;
        sqlx::query(&format!(
            "CREATE DATABASE {} TEMPLATE {}",
            database_name, TEMPLATE_DATABASE
        ))
        .execute(&mut admin)
        .await
        .context("Failed to create test database")?;
        admin.close().await?;

        let db_pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&format!("{}/{}", infra.server_url, database_name))
            .await
            .context("Failed to connect to test database")?;

        Ok(Self {
            db_pool,
            database_name,
        })
    }

    /// Wait for background executors to pick up work.
    pub async fn settle(&self) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
