//! Workflow identity records
//!
//! A workflow is created when a project is initialised and never hard-deleted.
//! `rotated_at` is the sole revocation mechanism for binding tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registered workflow identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-abc123")
    pub id: String,
    /// Account that owns the workflow and may request tokens for it
    pub owner_id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Environments a binding token may target (e.g., ["staging", "production"])
    pub environments: Vec<String>,
    /// Tokens issued strictly before this instant are revoked
    pub rotated_at: Option<DateTime<Utc>>,
    /// Soft lifecycle marker; archived workflows accept no deployments
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(id: String, owner_id: String, name: String, environments: Vec<String>) -> Self {
        Self {
            id,
            owner_id,
            name,
            environments,
            rotated_at: None,
            archived_at: None,
            created_at: now_micros(),
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn has_environment(&self, environment: &str) -> bool {
        self.environments.iter().any(|env| env == environment)
    }

    /// Whether a token issued at `issued_at` predates the latest rotation
    pub fn revokes(&self, issued_at: DateTime<Utc>) -> bool {
        matches!(self.rotated_at, Some(rotated_at) if issued_at < rotated_at)
    }
}

/// Current time truncated to the microsecond precision used in storage and tokens
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    from_micros(now.timestamp_micros()).unwrap_or(now)
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}
