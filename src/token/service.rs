//! Binding token issuance, verification and rotation
//!
//! Revocation is purely timestamp based: a token is valid while its `issuedAt` is
//! not earlier than the workflow's `rotatedAt`. Rotation is a hard cutover with no
//! grace period.

use crate::error::{GateError, ValidationError};
use crate::token::claims::{BindingClaims, ExpectedIdentity, BINDING_TOKEN_TYPE};
use crate::token::codec::{TokenSigner, TokenVerifier};
use crate::workflow::types::now_micros;
use crate::workflow::{Workflow, WorkflowLocks, WorkflowStorage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Parameters for `TokenService::issue`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub workflow_id: String,
    pub owner_id: String,
    pub environment: String,
    pub expected_identity: ExpectedIdentity,
    /// Revoke every earlier token before issuing this one
    #[serde(default)]
    pub rotate: bool,
}

/// Signed token plus the claims it carries, returned once at issue time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub claims: BindingClaims,
}

/// Issues and verifies binding tokens against the workflow ledger
pub struct TokenService {
    signer: TokenSigner,
    verifier: TokenVerifier,
    storage: WorkflowStorage,
    locks: WorkflowLocks,
}

impl TokenService {
    /// Create the service around the gate's signing key
    ///
    /// The verifier is derived from the same key, so tokens this service
    /// signs are the only ones it accepts.
    pub fn new(signer: TokenSigner, storage: WorkflowStorage) -> Self {
        let verifier = signer.verifier();
        Self {
            signer,
            verifier,
            storage,
            locks: WorkflowLocks::new(),
        }
    }

    /// Public half, published for out-of-band verification
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Issue a token for `workflow_id` + `environment`
    ///
    /// Fails with `IdentityConflict` while a non-revoked token exists for the
    /// same pair, unless the caller asked for rotation.
    pub async fn issue(&self, request: IssueRequest) -> Result<IssuedToken, GateError> {
        request
            .expected_identity
            .validate()
            .map_err(ValidationError::InvalidRequest)?;

        let _guard = self.locks.write(&request.workflow_id).await;

        let mut workflow = self
            .load_workflow(&request.workflow_id, &request.owner_id)
            .await?;
        if !workflow.has_environment(&request.environment) {
            return Err(ValidationError::InvalidRequest(format!(
                "environment '{}' is not configured for workflow {}",
                request.environment, workflow.id
            ))
            .into());
        }

        if request.rotate {
            workflow.rotated_at = Some(self.rotate_locked(&workflow).await?);
        } else if let Some(latest) = self
            .storage
            .latest_issued_at(&workflow.id, Some(&request.environment))
            .await?
        {
            if !workflow.revokes(latest) {
                return Err(ValidationError::IdentityConflict(format!(
                    "an active binding token already exists for {}/{}; request rotation to replace it",
                    workflow.id, request.environment
                ))
                .into());
            }
        }

        // Never stamp a token earlier than the rotation it must survive
        let now = now_micros();
        let issued_at = match workflow.rotated_at {
            Some(rotated_at) if rotated_at > now => rotated_at,
            _ => now,
        };

        let claims = BindingClaims {
            token_type: BINDING_TOKEN_TYPE.to_string(),
            unique_id: format!("tok-{}", uuid::Uuid::new_v4()),
            issued_at,
            workflow_id: workflow.id.clone(),
            owner_id: workflow.owner_id.clone(),
            environment: request.environment.clone(),
            expected_identity: request.expected_identity,
        };
        let token = self.signer.sign(&claims)?;

        self.storage
            .record_token(&claims.unique_id, &claims.workflow_id, &claims.environment, issued_at)
            .await?;

        tracing::info!(
            workflow_id = %claims.workflow_id,
            environment = %claims.environment,
            token_id = %claims.unique_id,
            "🔏 Issued binding token"
        );

        Ok(IssuedToken { token, claims })
    }

    /// Verify signature, discriminator, workflow ownership and revocation
    pub async fn verify(&self, token: &str) -> Result<BindingClaims, GateError> {
        let claims = self.verifier.decode(token)?;

        // Held until the revocation decision is made
        let _guard = self.locks.read(&claims.workflow_id).await;

        let workflow = match self.storage.get_workflow(&claims.workflow_id).await? {
            Some(workflow) if workflow.owner_id == claims.owner_id && !workflow.is_archived() => {
                workflow
            }
            _ => {
                return Err(ValidationError::TokenUnknownWorkflow(format!(
                    "workflow {} does not exist for owner {}",
                    claims.workflow_id, claims.owner_id
                ))
                .into())
            }
        };

        if !workflow.has_environment(&claims.environment) {
            return Err(ValidationError::TokenUnknownWorkflow(format!(
                "environment '{}' is not configured for workflow {}",
                claims.environment, workflow.id
            ))
            .into());
        }

        if workflow.revokes(claims.issued_at) {
            return Err(ValidationError::TokenRevoked(format!(
                "token {} issued at {} precedes rotation at {}",
                claims.unique_id,
                claims.issued_at.to_rfc3339(),
                workflow
                    .rotated_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            ))
            .into());
        }

        Ok(claims)
    }

    /// Revoke every token issued for the workflow so far
    pub async fn rotate(&self, workflow_id: &str) -> Result<DateTime<Utc>, GateError> {
        let _guard = self.locks.write(workflow_id).await;

        let workflow = self.storage.get_workflow(workflow_id).await?.ok_or_else(|| {
            ValidationError::TokenUnknownWorkflow(format!("workflow {} does not exist", workflow_id))
        })?;

        let rotated_at = self.rotate_locked(&workflow).await?;
        tracing::info!(workflow_id = %workflow_id, rotated_at = %rotated_at, "🔄 Rotated binding tokens");
        Ok(rotated_at)
    }

    /// Archive the workflow; its tokens stop verifying immediately
    pub async fn archive(&self, workflow_id: &str) -> Result<DateTime<Utc>, GateError> {
        let _guard = self.locks.write(workflow_id).await;

        let archived_at = now_micros();
        if !self.storage.archive_workflow(workflow_id, archived_at).await? {
            return Err(ValidationError::TokenUnknownWorkflow(format!(
                "workflow {} does not exist or is already archived",
                workflow_id
            ))
            .into());
        }
        tracing::info!(workflow_id = %workflow_id, "🗄️ Archived workflow");
        Ok(archived_at)
    }

    /// Pick a rotation instant strictly after every issued token and the previous rotation.
    /// Caller must hold the workflow's write guard.
    async fn rotate_locked(&self, workflow: &Workflow) -> anyhow::Result<DateTime<Utc>> {
        let mut rotated_at = now_micros();
        let floors = [
            self.storage.latest_issued_at(&workflow.id, None).await?,
            workflow.rotated_at,
        ];
        for floor in floors.into_iter().flatten() {
            if rotated_at <= floor {
                rotated_at = floor + Duration::microseconds(1);
            }
        }

        if !self.storage.set_rotated_at(&workflow.id, rotated_at).await? {
            anyhow::bail!("Workflow {} disappeared during rotation", workflow.id);
        }
        Ok(rotated_at)
    }

    async fn load_workflow(&self, workflow_id: &str, owner_id: &str) -> Result<Workflow, GateError> {
        match self.storage.get_workflow(workflow_id).await? {
            Some(workflow) if workflow.owner_id == owner_id && !workflow.is_archived() => Ok(workflow),
            _ => Err(ValidationError::TokenUnknownWorkflow(format!(
                "workflow {} does not exist for owner {}",
                workflow_id, owner_id
            ))
            .into()),
        }
    }
}
