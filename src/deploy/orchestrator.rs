//! Deployment pipeline
//!
//! Drives one upload through the validation stages, the quarantine deploy, the
//! registry read-back and finally promotion or rollback. Each attempt runs on
//! its own spawned task so a caller that goes away never leaves a deployment
//! half-validated.

use crate::analysis::StaticAnalyzer;
use crate::audit::{AuditLog, AuditQuery, AuditRecord, Outcome, Stage};
use crate::config::PipelineConfig;
use crate::deploy::state::{Validating, Verified};
use crate::deploy::storage::DeploymentStorage;
use crate::deploy::types::Deployment;
use crate::error::{GateError, ValidationError};
use crate::manifest::{Artifact, Manifest, ManifestValidator};
use crate::platform::{Alias, ComputeProvisioner, ExecutionRegistry, RegistryError, VersionRef};
use crate::sandbox::SandboxVerifier;
use crate::token::{peek_claims, BindingClaims, ExpectedIdentity, TokenService};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

/// Placeholder for record fields that only a verified token may supply
const UNVERIFIED: &str = "unverified";

/// Stages that must each have a `verified` record before promotion
const REQUIRED_STAGES: [Stage; 5] = [
    Stage::TokenVerify,
    Stage::ManifestCheck,
    Stage::QuarantineDeploy,
    Stage::Registration,
    Stage::Readback,
];

/// One upload: the bundle, its manifest and the binding token it claims
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub token: String,
    pub manifest: Manifest,
    pub artifact: Artifact,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_created_by() -> String {
    "anonymous".to_string()
}

/// Entry point of the pipeline; cheap to clone
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    inner: Arc<Pipeline>,
}

struct Pipeline {
    tokens: Arc<TokenService>,
    manifests: ManifestValidator,
    analyzer: StaticAnalyzer,
    sandbox: Arc<SandboxVerifier>,
    compute: Arc<dyn ComputeProvisioner>,
    registry: Arc<dyn ExecutionRegistry>,
    storage: DeploymentStorage,
    audit_log: Arc<AuditLog>,
    config: PipelineConfig,
}

impl DeploymentOrchestrator {
    /// Wire the pipeline around its collaborators
    ///
    /// The static analyzer shares the sandbox's module whitelist, so both
    /// stages agree on which imports are allowed.
    pub fn new(
        tokens: Arc<TokenService>,
        sandbox: Arc<SandboxVerifier>,
        compute: Arc<dyn ComputeProvisioner>,
        registry: Arc<dyn ExecutionRegistry>,
        storage: DeploymentStorage,
        audit_log: Arc<AuditLog>,
        config: PipelineConfig,
    ) -> Self {
        let analyzer = StaticAnalyzer::new(sandbox.config().allowed_modules.clone());
        Self {
            inner: Arc::new(Pipeline {
                tokens,
                manifests: ManifestValidator::new(),
                analyzer,
                sandbox,
                compute,
                registry,
                storage,
                audit_log,
                config,
            }),
        }
    }

    /// Run the whole pipeline for one upload and return the terminal record
    ///
    /// Validation rejections are not errors here: they come back as a
    /// `failed` or `rolled_back` deployment. `Err` means the gate itself
    /// could not record the outcome.
    pub async fn deploy(&self, request: DeployRequest) -> Result<Deployment, GateError> {
        let pipeline = Arc::clone(&self.inner);
        tokio::spawn(async move { pipeline.run(request).await })
            .await
            .map_err(|e| GateError::Internal(anyhow::anyhow!("Deployment task failed: {}", e)))?
    }

    /// Retrieve a deployment record by ID
    pub async fn get(&self, id: &str) -> anyhow::Result<Option<Deployment>> {
        self.inner.storage.get(id).await
    }

    /// Deployment history of a workflow, newest first
    pub async fn list_for_workflow(&self, workflow_id: &str) -> anyhow::Result<Vec<Deployment>> {
        self.inner.storage.list_for_workflow(workflow_id).await
    }
}

impl Pipeline {
    async fn run(&self, request: DeployRequest) -> Result<Deployment, GateError> {
        // Indexed fields stay `unverified` until the signature checks out; an
        // unsigned payload may name any workflow or token.
        let deployment = Deployment::new(
            UNVERIFIED.to_string(),
            UNVERIFIED.to_string(),
            request.created_by.clone(),
            request.artifact.hash(),
            None,
        );
        self.storage.insert(&deployment).await?;
        let claimed = peek_claims(&request.token).map(|c| {
            format!(
                "claimed (unverified) workflow={} environment={} token={}",
                c.workflow_id, c.environment, c.unique_id
            )
        });

        tracing::info!(
            deployment_id = %deployment.id,
            artifact_hash = %deployment.artifact_hash,
            "🚀 Deployment {} accepted ({} files)",
            deployment.id,
            request.artifact.files.len()
        );
        self.record(&deployment, Stage::Upload, Outcome::Completed, claimed)
            .await;

        let mut validating = Validating::new(deployment)
            .ok_or_else(|| anyhow::anyhow!("New deployment is not in validating"))?;

        match self.validate(&mut validating, &request).await {
            Ok(claims) => {
                let (verified, step) = validating.verify();
                self.storage.update(step.from, &step.deployment).await?;
                tracing::info!(deployment_id = %step.deployment.id, "🛡️ Pre-deploy checks passed");
                self.release(verified, &claims, &request).await
            }
            Err(err) => {
                let step = validating.fail(err.kind(), describe(&err));
                self.storage.update(step.from, &step.deployment).await?;
                tracing::warn!(
                    deployment_id = %step.deployment.id,
                    "❌ Deployment failed: {}",
                    describe(&err)
                );
                Ok(step.deployment)
            }
        }
    }

    /// Stages 1-2: token, manifest, declared identity. Nothing is provisioned here.
    async fn validate(
        &self,
        validating: &mut Validating,
        request: &DeployRequest,
    ) -> Result<BindingClaims, GateError> {
        let verified = self.tokens.verify(&request.token).await;
        if let Ok(claims) = &verified {
            validating.bind_claims(claims);
        }
        let claims = self
            .stage(validating.deployment(), Stage::TokenVerify, verified)
            .await?;
        let deployment = validating.deployment();

        let manifest_check = self
            .manifests
            .check(&request.manifest, &claims)
            .and_then(|()| self.manifests.check_artifact(&request.manifest, &request.artifact))
            .map_err(GateError::from);
        self.stage(deployment, Stage::ManifestCheck, manifest_check)
            .await?;

        let expected = &claims.expected_identity;
        let report = self.analyzer.extract_declared_identity(&request.artifact);
        if report.is_resolved()
            && check_identity(&report.names, expected, ValidationError::ServiceIdentityMismatch).is_ok()
        {
            self.record(
                deployment,
                Stage::StaticAnalysis,
                Outcome::Verified,
                Some(format!("declared {:?}", report.names)),
            )
            .await;
            return Ok(claims);
        }

        let reason = if report.is_resolved() {
            format!(
                "declared {:?} does not match expected '{}'",
                report.names, expected.service_name
            )
        } else {
            report
                .findings
                .iter()
                .map(|f| format!("{}:{}: {}", f.file, f.line, f.reason))
                .collect::<Vec<_>>()
                .join("; ")
        };
        self.record(deployment, Stage::StaticAnalysis, Outcome::Escalated, Some(reason))
            .await;

        let observed = self
            .sandbox
            .execute(&request.artifact, self.sandbox.config().timeout(), expected)
            .await
            .and_then(|report| {
                check_identity(&report.names, expected, ValidationError::ServiceIdentityMismatch)
            })
            .map_err(GateError::from);
        self.stage(deployment, Stage::SandboxVerify, observed).await?;

        Ok(claims)
    }

    /// Stages 3-5: quarantine, registration, read-back, then promote or roll back
    async fn release(
        &self,
        mut verified: Verified,
        claims: &BindingClaims,
        request: &DeployRequest,
    ) -> Result<Deployment, GateError> {
        match self.quarantine(&mut verified, claims, request).await {
            Ok(version) => self.promote(verified, version).await,
            Err(err) => self.roll_back(verified, err).await,
        }
    }

    async fn quarantine(
        &self,
        verified: &mut Verified,
        claims: &BindingClaims,
        request: &DeployRequest,
    ) -> Result<VersionRef, GateError> {
        let deployed = self
            .compute
            .deploy_version(&claims.workflow_id, &request.artifact, &request.manifest)
            .await;
        let version = match deployed {
            Ok(version) => version,
            Err(e) => {
                let err = internal("Quarantine deploy failed", e);
                self.reject(verified.deployment(), Stage::QuarantineDeploy, &err)
                    .await;
                return Err(err);
            }
        };

        let step = verified.quarantine(version.clone());
        self.storage.update(step.from, &step.deployment).await?;

        let aliased = self
            .compute
            .set_alias(Alias::Quarantine, &version)
            .await
            .map_err(|e| internal("Failed to set quarantine alias", e));
        self.stage(verified.deployment(), Stage::QuarantineDeploy, aliased)
            .await?;

        let registered = self
            .with_registry_retry(verified.deployment(), Stage::Registration, || {
                self.registry.register(&version)
            })
            .await
            .map_err(GateError::from);
        self.stage(verified.deployment(), Stage::Registration, registered)
            .await?;

        let expected = &claims.expected_identity;
        let read_back = self
            .with_registry_retry(verified.deployment(), Stage::Readback, || {
                self.registry.list_service_names(&version)
            })
            .await
            .and_then(|names| check_identity(&names, expected, ValidationError::RegistrationMismatch))
            .map_err(GateError::from);
        self.stage(verified.deployment(), Stage::Readback, read_back)
            .await?;

        self.check_audit_trail(verified.deployment()).await?;
        Ok(version)
    }

    async fn promote(&self, verified: Verified, version: VersionRef) -> Result<Deployment, GateError> {
        if let Err(e) = self.compute.set_alias(Alias::Production, &version).await {
            let err = internal("Failed to move production alias", e);
            self.reject(verified.deployment(), Stage::Promote, &err).await;
            return self.roll_back(verified, err).await;
        }

        // Production now routes to this version
        if let Err(e) = self.compute.delete_alias(Alias::Quarantine, &version).await {
            tracing::warn!(
                deployment_id = %verified.deployment().id,
                "Failed to drop quarantine alias after promotion: {}",
                e
            );
        }

        let step = verified.promote(format!(
            "promoted {} version {}",
            version.function, version.version
        ));
        self.storage.update(step.from, &step.deployment).await?;
        self.record(
            &step.deployment,
            Stage::Promote,
            Outcome::Verified,
            step.deployment.result_message.clone(),
        )
        .await;

        tracing::info!(
            deployment_id = %step.deployment.id,
            workflow_id = %step.deployment.workflow_id,
            "✅ Deployment promoted to production"
        );
        Ok(step.deployment)
    }

    /// Undo whatever the quarantine stage provisioned, then record `rolled_back`
    async fn roll_back(&self, verified: Verified, err: GateError) -> Result<Deployment, GateError> {
        let mut cleanup_failures = Vec::new();

        if let Some(version) = verified.deployment().artifact_version_ref.clone() {
            if let Err(e) = self.registry.deregister(&version).await {
                cleanup_failures.push(format!("deregister {}: {}", version.endpoint, e));
            }
            if let Err(e) = self.compute.delete_alias(Alias::Quarantine, &version).await {
                cleanup_failures.push(format!("delete quarantine alias: {}", e));
            }
            if let Err(e) = self.compute.delete_version(&version).await {
                cleanup_failures.push(format!("delete version {}: {}", version.version, e));
            }
        }

        let mut message = describe(&err);
        let outcome = if cleanup_failures.is_empty() {
            Outcome::Completed
        } else {
            message.push_str("; cleanup failed: ");
            message.push_str(&cleanup_failures.join("; "));
            tracing::error!(
                deployment_id = %verified.deployment().id,
                "🧹 Rollback left resources behind: {}",
                cleanup_failures.join("; ")
            );
            Outcome::Rejected
        };
        self.record(verified.deployment(), Stage::Rollback, outcome, Some(message.clone()))
            .await;

        let step = verified.roll_back(err.kind(), message);
        self.storage.update(step.from, &step.deployment).await?;

        tracing::warn!(
            deployment_id = %step.deployment.id,
            "↩️ Deployment rolled back: {}",
            step.deployment.result_message.as_deref().unwrap_or("")
        );
        Ok(step.deployment)
    }

    /// Retry transient registry faults with capped exponential backoff
    async fn with_registry_retry<T, F, Fut>(
        &self,
        deployment: &Deployment,
        stage: Stage,
        mut call: F,
    ) -> Result<T, ValidationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(RegistryError::Rejected(message)) => ValidationError::RegistrationMismatch(format!(
                    "registry refused the endpoint: {}",
                    message
                )),
                Err(RegistryError::Unavailable(message)) => ValidationError::RegistryUnavailable(message),
            };

            if !err.kind().is_transient() {
                return Err(err);
            }
            if attempt >= self.config.registry_max_retries {
                return Err(ValidationError::RegistrationMismatch(format!(
                    "gave up after {} attempts: {}",
                    attempt + 1,
                    err
                )));
            }

            let delay = self.config.backoff(attempt);
            self.record(
                deployment,
                stage,
                Outcome::Retried,
                Some(format!("{}; retrying in {} ms", err, delay.as_millis())),
            )
            .await;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Refuse promotion unless every required stage left a `verified` record
    /// for this exact artifact and token
    async fn check_audit_trail(&self, deployment: &Deployment) -> Result<(), GateError> {
        let records = match self
            .audit_log
            .query(&AuditQuery::deployment(&deployment.id))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                let err = GateError::from(ValidationError::StageSkipped(format!(
                    "audit trail unreadable: {}",
                    e
                )));
                self.reject(deployment, Stage::Promote, &err).await;
                return Err(err);
            }
        };

        let passed = |stage: Stage| {
            records.iter().any(|r| {
                r.stage == stage
                    && r.outcome == Outcome::Verified
                    && r.artifact_hash == deployment.artifact_hash
                    && r.token_id == deployment.token_id
            })
        };

        let mut missing: Vec<String> = REQUIRED_STAGES
            .iter()
            .filter(|stage| !passed(**stage))
            .map(|stage| format!("{:?}", stage))
            .collect();
        if !passed(Stage::StaticAnalysis) && !passed(Stage::SandboxVerify) {
            missing.push("StaticAnalysis or SandboxVerify".to_string());
        }

        if missing.is_empty() {
            return Ok(());
        }
        let err = GateError::from(ValidationError::StageSkipped(format!(
            "no verified record for {}",
            missing.join(", ")
        )));
        self.reject(deployment, Stage::Promote, &err).await;
        Err(err)
    }

    /// Audit the result of a stage and pass it through
    async fn stage<T>(
        &self,
        deployment: &Deployment,
        stage: Stage,
        result: Result<T, GateError>,
    ) -> Result<T, GateError> {
        match &result {
            Ok(_) => {
                self.record(deployment, stage, Outcome::Verified, None)
                    .await
            }
            Err(err) => self.reject(deployment, stage, err).await,
        }
        result
    }

    async fn reject(&self, deployment: &Deployment, stage: Stage, err: &GateError) {
        self.record(deployment, stage, Outcome::Rejected, Some(describe(err)))
            .await;
    }

    /// Append one audit record. A failed append is logged; the promotion gate
    /// will then find the record missing and refuse.
    async fn record(
        &self,
        deployment: &Deployment,
        stage: Stage,
        outcome: Outcome,
        message: Option<String>,
    ) {
        let record = AuditRecord {
            deployment_id: deployment.id.clone(),
            stage,
            outcome,
            timestamp: Utc::now(),
            artifact_hash: deployment.artifact_hash.clone(),
            token_id: deployment.token_id.clone(),
            message,
        };
        if let Err(e) = self.audit_log.append(&record).await {
            tracing::error!(
                deployment_id = %deployment.id,
                "Failed to append audit record for {:?}: {}",
                stage,
                e
            );
        }
    }
}

/// Observed names must be exactly `{serviceName}` and within `maxServices`
fn check_identity(
    names: &BTreeSet<String>,
    expected: &ExpectedIdentity,
    mismatch: fn(String) -> ValidationError,
) -> Result<(), ValidationError> {
    if names.len() > expected.max_services as usize {
        return Err(ValidationError::ServiceIdentityMismatch(format!(
            "{} services {:?} exceed the limit of {}",
            names.len(),
            names,
            expected.max_services
        )));
    }
    if names.len() != 1 || !names.contains(&expected.service_name) {
        return Err(mismatch(format!(
            "observed {:?}, expected exactly '{}'",
            names, expected.service_name
        )));
    }
    Ok(())
}

fn internal(context: &str, e: anyhow::Error) -> GateError {
    GateError::Internal(anyhow::anyhow!("{}: {}", context, e))
}

/// `resultMessage` text: the taxonomy-prefixed error, or an internal fault
fn describe(err: &GateError) -> String {
    match err {
        GateError::Rejected(e) => e.to_string(),
        GateError::Internal(e) => format!("Internal: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::database::Database;
    use crate::deploy::types::DeploymentStatus;
    use crate::error::ErrorKind;
    use crate::manifest::LUA_BUNDLE_FORMAT;
    use crate::platform::{LocalCompute, LocalRegistry};
    use crate::token::{IssueRequest, TokenSigner};
    use crate::workflow::{Workflow, WorkflowStorage};

    struct Harness {
        orchestrator: DeploymentOrchestrator,
        tokens: Arc<TokenService>,
        compute: Arc<LocalCompute>,
        registry: Arc<LocalRegistry>,
        audit_log: Arc<AuditLog>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let workflows = WorkflowStorage::new(db.pool());
        workflows
            .create_workflow(&Workflow::new(
                "wf-abc123".into(),
                "owner-1".into(),
                "Orders".into(),
                vec!["production".into()],
            ))
            .await
            .unwrap();

        let tokens = Arc::new(TokenService::new(TokenSigner::generate(), workflows));
        let sandbox = Arc::new(SandboxVerifier::new(SandboxConfig::default()));
        let compute = Arc::new(LocalCompute::new(Arc::clone(&sandbox)));
        let registry = Arc::new(LocalRegistry::new(compute.clone()));
        let audit_log = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());

        let orchestrator = DeploymentOrchestrator::new(
            Arc::clone(&tokens),
            sandbox,
            compute.clone(),
            registry.clone(),
            DeploymentStorage::new(db.pool()),
            Arc::clone(&audit_log),
            PipelineConfig {
                registry_max_retries: 2,
                registry_backoff_ms: 1,
                registry_backoff_max_ms: 5,
                registry_admin_url: None,
            },
        );

        Harness {
            orchestrator,
            tokens,
            compute,
            registry,
            audit_log,
            _dir: dir,
        }
    }

    async fn token(tokens: &TokenService) -> String {
        tokens
            .issue(IssueRequest {
                workflow_id: "wf-abc123".into(),
                owner_id: "owner-1".into(),
                environment: "production".into(),
                expected_identity: ExpectedIdentity {
                    service_name: "wf-abc123".into(),
                    entry_point: "main.lua".into(),
                    handler_export: "handler".into(),
                    max_services: 1,
                    min_sdk_version: "1.0.0".into(),
                },
                rotate: true,
            })
            .await
            .unwrap()
            .token
    }

    fn request(token: String, source: &str) -> DeployRequest {
        let artifact = Artifact::default().with_file("main.lua", source);
        DeployRequest {
            token,
            manifest: Manifest {
                entry_point: "main.lua".into(),
                handler_export: "handler".into(),
                format: LUA_BUNDLE_FORMAT.into(),
                artifact_hash: artifact.hash(),
            },
            artifact,
            created_by: "ci".into(),
        }
    }

    const GOOD: &str = r#"
        local restate = require("restate")
        local svc = restate.service{ name = "wf-abc123" }
        return { handler = restate.endpoint():bind(svc):handler() }
    "#;

    const COMPUTED: &str = r#"
        local restate = require("restate")
        local prefix = "wf-"
        local svc = restate.service{ name = prefix .. "abc123" }
        return { handler = restate.endpoint():bind(svc):handler() }
    "#;

    async fn stages(audit_log: &AuditLog, deployment: &Deployment) -> Vec<(Stage, Outcome)> {
        audit_log
            .query(&AuditQuery::deployment(&deployment.id))
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.stage, r.outcome))
            .collect()
    }

    #[tokio::test]
    async fn matching_bundle_is_promoted() {
        let h = harness().await;
        let token = token(&h.tokens).await;
        let deployment = h.orchestrator.deploy(request(token, GOOD)).await.unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Promoted);
        assert_eq!(deployment.alias, Some(Alias::Production));
        let version = deployment.artifact_version_ref.clone().unwrap();
        assert_eq!(
            h.compute.alias_target("wf-abc123", Alias::Production).await,
            Some(version.clone())
        );
        assert_eq!(h.compute.alias_target("wf-abc123", Alias::Quarantine).await, None);
        assert_eq!(
            h.registry.list_service_names(&version).await.unwrap(),
            BTreeSet::from(["wf-abc123".to_string()])
        );

        let trail = stages(&h.audit_log, &deployment).await;
        assert!(trail.contains(&(Stage::StaticAnalysis, Outcome::Verified)));
        assert!(!trail.iter().any(|(stage, _)| *stage == Stage::SandboxVerify));
        assert_eq!(trail.last(), Some(&(Stage::Promote, Outcome::Verified)));

        let stored = h.orchestrator.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(stored, deployment);
    }

    #[tokio::test]
    async fn computed_name_escalates_to_the_sandbox() {
        let h = harness().await;
        let token = token(&h.tokens).await;
        let deployment = h.orchestrator.deploy(request(token, COMPUTED)).await.unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Promoted);
        let trail = stages(&h.audit_log, &deployment).await;
        assert!(trail.contains(&(Stage::StaticAnalysis, Outcome::Escalated)));
        assert!(trail.contains(&(Stage::SandboxVerify, Outcome::Verified)));
    }

    #[tokio::test]
    async fn wrong_service_name_fails_before_provisioning() {
        let h = harness().await;
        let token = token(&h.tokens).await;
        let source = GOOD.replace("\"wf-abc123\"", "\"MaliciousService\"");
        let deployment = h.orchestrator.deploy(request(token, &source)).await.unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert_eq!(deployment.error_kind, Some(ErrorKind::ServiceIdentityMismatch));
        assert!(deployment
            .result_message
            .as_deref()
            .unwrap()
            .starts_with("ServiceIdentityMismatch"));
        assert_eq!(h.compute.version_count().await, 0);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn tampered_bundle_is_a_manifest_mismatch() {
        let h = harness().await;
        let token = token(&h.tokens).await;
        let mut upload = request(token, GOOD);
        upload.artifact = upload.artifact.with_file("extra.lua", "return {}");

        let deployment = h.orchestrator.deploy(upload).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert_eq!(deployment.error_kind, Some(ErrorKind::ManifestMismatch));
    }

    #[tokio::test]
    async fn garbage_token_still_leaves_a_record() {
        let h = harness().await;
        let deployment = h
            .orchestrator
            .deploy(request("garbage".into(), GOOD))
            .await
            .unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Failed);
        assert_eq!(deployment.error_kind, Some(ErrorKind::TokenInvalid));
        assert_eq!(deployment.workflow_id, UNVERIFIED);
        assert_eq!(
            stages(&h.audit_log, &deployment).await,
            vec![
                (Stage::Upload, Outcome::Completed),
                (Stage::TokenVerify, Outcome::Rejected)
            ]
        );
    }

    #[tokio::test]
    async fn forged_payload_does_not_label_the_victims_history() {
        let h = harness().await;
        let genuine = token(&h.tokens).await;
        let (payload, _) = genuine.split_once('.').unwrap();
        let forged = format!("{}.AAAA", payload);

        let deployment = h.orchestrator.deploy(request(forged, GOOD)).await.unwrap();

        assert_eq!(deployment.error_kind, Some(ErrorKind::TokenInvalid));
        assert_eq!(deployment.workflow_id, UNVERIFIED);
        assert_eq!(deployment.environment, UNVERIFIED);
        assert_eq!(deployment.token_id, None);
        assert!(h.orchestrator.list_for_workflow("wf-abc123").await.unwrap().is_empty());

        let records = h
            .audit_log
            .query(&AuditQuery::deployment(&deployment.id))
            .await
            .unwrap();
        assert!(records.iter().all(|r| r.token_id.is_none()));
        assert!(records[0]
            .message
            .as_deref()
            .unwrap()
            .contains("claimed (unverified) workflow=wf-abc123"));
    }

    #[tokio::test]
    async fn verified_records_carry_the_token_id() {
        let h = harness().await;
        let token = token(&h.tokens).await;
        let deployment = h.orchestrator.deploy(request(token, GOOD)).await.unwrap();
        assert_eq!(deployment.workflow_id, "wf-abc123");

        let records = h
            .audit_log
            .query(&AuditQuery::deployment(&deployment.id))
            .await
            .unwrap();
        let verify = records
            .iter()
            .find(|r| r.stage == Stage::TokenVerify)
            .unwrap();
        assert_eq!(verify.token_id, deployment.token_id);
        assert_eq!(
            h.orchestrator.list_for_workflow("wf-abc123").await.unwrap().len(),
            1
        );
    }

    #[test]
    fn identity_check_enforces_exact_match_and_limit() {
        let expected = ExpectedIdentity {
            service_name: "wf-abc123".into(),
            entry_point: "main.lua".into(),
            handler_export: "handler".into(),
            max_services: 1,
            min_sdk_version: String::new(),
        };
        let set = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>();

        assert!(check_identity(&set(&["wf-abc123"]), &expected, ValidationError::RegistrationMismatch).is_ok());
        assert!(matches!(
            check_identity(&set(&["other"]), &expected, ValidationError::RegistrationMismatch),
            Err(ValidationError::RegistrationMismatch(_))
        ));
        assert!(matches!(
            check_identity(&set(&[]), &expected, ValidationError::RegistrationMismatch),
            Err(ValidationError::RegistrationMismatch(_))
        ));
        assert!(matches!(
            check_identity(&set(&["wf-abc123", "extra"]), &expected, ValidationError::RegistrationMismatch),
            Err(ValidationError::ServiceIdentityMismatch(_))
        ));
    }
}
