//! Append-only JSON lines audit trail
//!
//! One record per pipeline decision, written to `{data_dir}/audit.jsonl` and
//! mirrored to tracing. Records are never rewritten or removed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Pipeline stage a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    TokenVerify,
    ManifestCheck,
    StaticAnalysis,
    SandboxVerify,
    QuarantineDeploy,
    Registration,
    Readback,
    Promote,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The stage passed
    Verified,
    Rejected,
    /// Inconclusive; handed to the next, more expensive stage
    Escalated,
    /// Transient fault, the stage will be attempted again
    Retried,
    /// Bookkeeping step finished (upload accepted, cleanup done)
    Completed,
}

/// One stage decision for one deployment
///
/// `tokenId` is absent until the token has been verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub deployment_id: String,
    pub stage: Stage,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    pub artifact_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Query filter; unset fields match everything
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub deployment_id: Option<String>,
    pub artifact_hash: Option<String>,
}

impl AuditQuery {
    pub fn deployment(id: &str) -> Self {
        Self {
            deployment_id: Some(id.to_string()),
            artifact_hash: None,
        }
    }

    fn matches(&self, record: &AuditRecord) -> bool {
        self.deployment_id
            .as_deref()
            .map_or(true, |id| record.deployment_id == id)
            && self
                .artifact_hash
                .as_deref()
                .map_or(true, |hash| record.artifact_hash == hash)
    }
}

/// File-backed audit trail shared by every pipeline task
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    /// Serialises appends so lines never interleave
    writer: Mutex<()>,
}

impl AuditLog {
    /// Open (or create) the log file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                anyhow::anyhow!("Failed to create audit directory {}: {}", parent.display(), e)
            })?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open audit file {}: {}", path.display(), e))?;

        tracing::info!("📜 Audit log at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one record
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| anyhow::anyhow!("Failed to serialize audit record: {}", e))?;
        line.push('\n');

        {
            let _guard = self.writer.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open audit file {}: {}", self.path.display(), e))?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to write audit record: {}", e))?;
            file.sync_data()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to sync audit file: {}", e))?;
        }

        match record.outcome {
            Outcome::Rejected => tracing::warn!(
                deployment_id = %record.deployment_id,
                stage = ?record.stage,
                artifact_hash = %record.artifact_hash,
                "AUDIT: {:?} rejected: {}",
                record.stage,
                record.message.as_deref().unwrap_or("")
            ),
            _ => tracing::info!(
                deployment_id = %record.deployment_id,
                stage = ?record.stage,
                artifact_hash = %record.artifact_hash,
                "AUDIT: {:?} {:?}",
                record.stage,
                record.outcome
            ),
        }

        Ok(())
    }

    /// Records matching `filter`, in append order
    ///
    /// Reads without the writer lock so queries never stall appends. A line an
    /// append is still writing has no newline yet and is left for the next read.
    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read audit file {}: {}",
                    self.path.display(),
                    e
                ))
            }
        };

        let mut records = Vec::new();
        let complete = contents
            .split_inclusive(|byte| *byte == b'\n')
            .filter(|line| line.ends_with(b"\n"));
        for (number, line) in complete.enumerate() {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Skipping corrupt audit line {}: {}", number + 1, e),
            }
        }
        Ok(records)
    }
}
