//! SQLite persistence for workflow identities and issued binding tokens

use crate::workflow::types::{from_micros, Workflow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};

/// Workflow and token-ledger storage
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new workflow. Returns false when the id is already taken.
    pub async fn create_workflow(&self, workflow: &Workflow) -> Result<bool> {
        let environments = serde_json::to_string(&workflow.environments)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflows (id, owner_id, name, environments, rotated_at, archived_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.owner_id)
        .bind(&workflow.name)
        .bind(&environments)
        .bind(workflow.rotated_at.map(|t| t.timestamp_micros()))
        .bind(workflow.archived_at.map(|t| t.timestamp_micros()))
        .bind(workflow.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Retrieve a workflow by ID, archived ones included
    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, environments, rotated_at, archived_at, created_at FROM workflows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| workflow_from_row(&row)).transpose()
    }

    /// Move the rotation watermark; tokens issued before it are revoked
    pub async fn set_rotated_at(&self, id: &str, rotated_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE workflows SET rotated_at = ? WHERE id = ?")
            .bind(rotated_at.timestamp_micros())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete: the record stays for forensic lookups
    pub async fn archive_workflow(&self, id: &str, archived_at: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE workflows SET archived_at = ? WHERE id = ? AND archived_at IS NULL")
                .bind(archived_at.timestamp_micros())
                .bind(id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Add an issued token to the ledger
    ///
    /// The ledger keeps ids and issue times only, never the token itself.
    pub async fn record_token(
        &self,
        token_id: &str,
        workflow_id: &str,
        environment: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO binding_tokens (token_id, workflow_id, environment, issued_at) VALUES (?, ?, ?, ?)",
        )
        .bind(token_id)
        .bind(workflow_id)
        .bind(environment)
        .bind(issued_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Latest `issued_at` among tokens of a workflow, optionally narrowed to one environment
    pub async fn latest_issued_at(
        &self,
        workflow_id: &str,
        environment: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = match environment {
            Some(env) => {
                sqlx::query_scalar(
                    "SELECT MAX(issued_at) FROM binding_tokens WHERE workflow_id = ? AND environment = ?",
                )
                .bind(workflow_id)
                .bind(env)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT MAX(issued_at) FROM binding_tokens WHERE workflow_id = ?")
                    .bind(workflow_id)
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        Ok(latest.and_then(from_micros))
    }
}

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow> {
    let environments: String = row.get("environments");
    let created_at: i64 = row.get("created_at");
    let rotated_at: Option<i64> = row.get("rotated_at");
    let archived_at: Option<i64> = row.get("archived_at");

    Ok(Workflow {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        environments: serde_json::from_str(&environments)?,
        rotated_at: rotated_at.and_then(from_micros),
        archived_at: archived_at.and_then(from_micros),
        created_at: from_micros(created_at)
            .ok_or_else(|| anyhow::anyhow!("Corrupt created_at for workflow"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::workflow::types::now_micros;

    async fn storage() -> WorkflowStorage {
        let db = Database::in_memory().await.unwrap();
        WorkflowStorage::new(db.pool())
    }

    fn workflow(id: &str) -> Workflow {
        Workflow::new(id.into(), "owner-1".into(), "Demo".into(), vec!["production".into()])
    }

    #[tokio::test]
    async fn create_is_idempotent_per_id() {
        let storage = storage().await;
        assert!(storage.create_workflow(&workflow("wf-1")).await.unwrap());
        assert!(!storage.create_workflow(&workflow("wf-1")).await.unwrap());

        let original = workflow("wf-1");
        let loaded = storage.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, original.owner_id);
        assert_eq!(loaded.environments, vec!["production".to_string()]);
        assert_eq!(loaded.rotated_at, None);
    }

    #[tokio::test]
    async fn archive_keeps_the_record() {
        let storage = storage().await;
        storage.create_workflow(&workflow("wf-2")).await.unwrap();

        assert!(storage.archive_workflow("wf-2", now_micros()).await.unwrap());
        assert!(!storage.archive_workflow("wf-2", now_micros()).await.unwrap());

        let loaded = storage.get_workflow("wf-2").await.unwrap().unwrap();
        assert!(loaded.is_archived());
    }

    #[tokio::test]
    async fn latest_issued_at_filters_by_environment() {
        let storage = storage().await;
        storage.create_workflow(&workflow("wf-3")).await.unwrap();
        let t1 = now_micros();
        let t2 = t1 + chrono::Duration::seconds(5);
        storage.record_token("tok-a", "wf-3", "staging", t1).await.unwrap();
        storage.record_token("tok-b", "wf-3", "production", t2).await.unwrap();

        assert_eq!(storage.latest_issued_at("wf-3", Some("staging")).await.unwrap(), Some(t1));
        assert_eq!(storage.latest_issued_at("wf-3", None).await.unwrap(), Some(t2));
        assert_eq!(storage.latest_issued_at("wf-9", None).await.unwrap(), None);
    }
}
