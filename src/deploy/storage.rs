//! SQLite persistence for deployment records
//!
//! The full record lives in a JSON column; the indexed columns are copies
//! kept for lookups. Updates are compare-and-set on the previous status, so
//! a record can never be moved along an edge the transition table forbids.

use crate::deploy::types::{Deployment, DeploymentStatus};
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};

/// Deployment record storage
///
/// Stores the whole record as JSON next to indexed copies of the id,
/// workflow, status, artifact hash and token id.
#[derive(Debug, Clone)]
pub struct DeploymentStorage {
    pool: SqlitePool,
}

impl DeploymentStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new deployment record
    ///
    /// Records are only ever created in `validating`; any other status is
    /// refused before touching the database.
    pub async fn insert(&self, deployment: &Deployment) -> Result<()> {
        if deployment.status != DeploymentStatus::Validating {
            anyhow::bail!(
                "Deployment {} must be created in validating, not {}",
                deployment.id,
                deployment.status
            );
        }
        let record = serde_json::to_string(deployment)?;

        sqlx::query(
            r#"
            INSERT INTO deployments (id, workflow_id, environment, status, artifact_hash, token_id, record, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&deployment.id)
        .bind(&deployment.workflow_id)
        .bind(&deployment.environment)
        .bind(deployment.status.as_str())
        .bind(&deployment.artifact_hash)
        .bind(&deployment.token_id)
        .bind(&record)
        .bind(deployment.created_at.to_rfc3339())
        .bind(deployment.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to insert deployment {}: {}", deployment.id, e))?;

        Ok(())
    }

    /// Persist `deployment`, provided the stored status is still `from`
    ///
    /// `from == deployment.status` saves progress within a state (e.g. the
    /// quarantined version); anything else must be a legal transition.
    pub async fn update(&self, from: DeploymentStatus, deployment: &Deployment) -> Result<()> {
        let to = deployment.status;
        if from != to && !from.can_transition_to(to) {
            anyhow::bail!("Illegal deployment transition {} -> {} for {}", from, to, deployment.id);
        }
        let record = serde_json::to_string(deployment)?;

        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET workflow_id = ?, environment = ?, status = ?, token_id = ?, record = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(&deployment.workflow_id)
        .bind(&deployment.environment)
        .bind(to.as_str())
        .bind(&deployment.token_id)
        .bind(&record)
        .bind(deployment.updated_at.to_rfc3339())
        .bind(&deployment.id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!(
                "Deployment {} is no longer {}; refusing to move it to {}",
                deployment.id,
                from,
                to
            );
        }
        Ok(())
    }

    /// Retrieve a deployment by ID
    pub async fn get(&self, id: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query("SELECT record FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| decode(row.get("record"))).transpose()
    }

    /// Newest first
    pub async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT record FROM deployments WHERE workflow_id = ? ORDER BY created_at DESC, id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| decode(row.get("record"))).collect()
    }
}

fn decode(record: String) -> Result<Deployment> {
    serde_json::from_str(&record).map_err(|e| anyhow::anyhow!("Corrupt deployment record: {}", e))
}
