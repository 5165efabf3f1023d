//! Typestate handles for an in-flight deployment
//!
//! A `Validating` deployment can only become `Verified` or `failed`; a
//! `Verified` one can only become `promoted` or `rolled_back`. Each transition
//! consumes the handle and returns the previous status so storage can
//! compare-and-set on it.

use crate::deploy::types::{Deployment, DeploymentStatus};
use crate::error::ErrorKind;
use crate::platform::{Alias, VersionRef};
use crate::token::BindingClaims;
use chrono::Utc;

/// Record that moved from `from` to its current status
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: DeploymentStatus,
    pub deployment: Deployment,
}

fn transition(mut deployment: Deployment, to: DeploymentStatus) -> Transition {
    let from = deployment.status;
    deployment.status = to;
    deployment.updated_at = Utc::now();
    Transition { from, deployment }
}

/// A deployment still inside the pre-deploy checks
///
/// Nothing has been provisioned for it yet, so failing it needs no cleanup.
#[derive(Debug)]
pub struct Validating {
    deployment: Deployment,
}

impl Validating {
    /// Wrap a freshly created record. Returns `None` if it is not `validating`.
    pub fn new(deployment: Deployment) -> Option<Self> {
        (deployment.status == DeploymentStatus::Validating).then_some(Self { deployment })
    }

    /// Current in-memory record, including claims bound so far
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Adopt the identity from verified claims
    pub fn bind_claims(&mut self, claims: &BindingClaims) {
        self.deployment.workflow_id = claims.workflow_id.clone();
        self.deployment.environment = claims.environment.clone();
        self.deployment.token_id = Some(claims.unique_id.clone());
    }

    /// Every pre-deploy check passed
    ///
    /// Returns the handle that may provision compute, plus the
    /// `validating -> verified` step to persist.
    pub fn verify(self) -> (Verified, Transition) {
        let step = transition(self.deployment, DeploymentStatus::Verified);
        (
            Verified {
                deployment: step.deployment.clone(),
            },
            step,
        )
    }

    /// Terminal `failed`; `kind` is `None` for internal faults
    pub fn fail(self, kind: Option<ErrorKind>, message: String) -> Transition {
        let mut step = transition(self.deployment, DeploymentStatus::Failed);
        step.deployment.error_kind = kind;
        step.deployment.result_message = Some(message);
        step
    }
}

/// A deployment cleared for quarantine
///
/// From here on every failure must undo what was provisioned, which is why
/// the only terminal moves are `promote` and `roll_back`.
#[derive(Debug)]
pub struct Verified {
    deployment: Deployment,
}

impl Verified {
    /// Current record, including the quarantined version once known
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Record the quarantined compute version; status is unchanged
    pub fn quarantine(&mut self, version: VersionRef) -> Transition {
        self.deployment.artifact_version_ref = Some(version);
        self.deployment.alias = Some(Alias::Quarantine);
        self.deployment.updated_at = Utc::now();
        Transition {
            from: DeploymentStatus::Verified,
            deployment: self.deployment.clone(),
        }
    }

    /// Terminal `promoted`; the production alias now routes to the version
    pub fn promote(self, message: String) -> Transition {
        let mut step = transition(self.deployment, DeploymentStatus::Promoted);
        step.deployment.alias = Some(Alias::Production);
        step.deployment.result_message = Some(message);
        step
    }

    /// Terminal `rolled_back` after cleanup; no alias remains
    pub fn roll_back(self, kind: Option<ErrorKind>, message: String) -> Transition {
        let mut step = transition(self.deployment, DeploymentStatus::RolledBack);
        step.deployment.alias = None;
        step.deployment.error_kind = kind;
        step.deployment.result_message = Some(message);
        step
    }
}
