//! SQLite database bootstrap
//!
//! One database file per gate instance: `{data_dir}/gate.db` holding workflows,
//! issued binding tokens and deployment records.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Owner of the connection pool and schema
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) `{data_dir}/gate.db` and initialise the schema
    pub async fn connect(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e)
        })?;
        let db_path = Path::new(data_dir).join("gate.db");

        tracing::info!("🗄️ Opening gate database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Private in-memory database for tests and ephemeral runs
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Safe to call multiple times (uses IF NOT EXISTS)
    async fn init_schema(&self) -> Result<()> {
        // Timestamps are microseconds since the Unix epoch
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                environments JSON NOT NULL,
                rotated_at INTEGER,
                archived_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binding_tokens (
                token_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                issued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                status TEXT NOT NULL,
                artifact_hash TEXT NOT NULL,
                token_id TEXT,
                record JSON NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tokens_workflow_env ON binding_tokens(workflow_id, environment)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_deployments_workflow ON deployments(workflow_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
