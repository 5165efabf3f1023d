//! Deployment records and their status transition table

use crate::error::ErrorKind;
use crate::platform::{Alias, VersionRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of one upload attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Validating,
    Verified,
    Promoted,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Validating => "validating",
            DeploymentStatus::Verified => "verified",
            DeploymentStatus::Promoted => "promoted",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Promoted | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    /// The transition table. Everything not listed is illegal.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Validating, Verified) | (Validating, Failed) | (Verified, Promoted) | (Verified, RolledBack)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validating" => Ok(DeploymentStatus::Validating),
            "verified" => Ok(DeploymentStatus::Verified),
            "promoted" => Ok(DeploymentStatus::Promoted),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            other => Err(anyhow::anyhow!("Unknown deployment status: {}", other)),
        }
    }
}

/// Persisted deployment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique per attempt; retries create new records
    pub id: String,
    pub workflow_id: String,
    pub environment: String,
    /// Compute version created for this attempt, once quarantined
    pub artifact_version_ref: Option<VersionRef>,
    pub alias: Option<Alias>,
    pub status: DeploymentStatus,
    /// Taxonomy-named failure description, or the success summary
    pub result_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_by: String,
    pub artifact_hash: String,
    pub token_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Fresh record in `validating`
    pub fn new(
        workflow_id: String,
        environment: String,
        created_by: String,
        artifact_hash: String,
        token_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("dep-{}", uuid::Uuid::new_v4()),
            workflow_id,
            environment,
            artifact_version_ref: None,
            alias: None,
            status: DeploymentStatus::Validating,
            result_message: None,
            error_kind: None,
            created_by,
            artifact_hash,
            token_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    const ALL: [DeploymentStatus; 5] = [Validating, Verified, Promoted, Failed, RolledBack];

    #[test]
    fn failed_never_reaches_promoted() {
        assert!(!Failed.can_transition_to(Promoted));
        assert!(!Validating.can_transition_to(Promoted));
        assert!(!RolledBack.can_transition_to(Promoted));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn status_names_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.as_str().into())
            );
        }
    }

    #[test]
    fn new_deployments_start_validating_with_unique_ids() {
        let a = Deployment::new("wf".into(), "production".into(), "ci".into(), "h".into(), None);
        let b = Deployment::new("wf".into(), "production".into(), "ci".into(), "h".into(), None);
        assert_eq!(a.status, Validating);
        assert_ne!(a.id, b.id);
    }
}
