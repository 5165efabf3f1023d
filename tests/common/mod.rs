//! Shared fixtures for the integration tests: recording fakes for the compute
//! platform and execution registry, and a gate wired around them.

#![allow(dead_code)]

use async_trait::async_trait;
use deploy_gate::audit::AuditLog;
use deploy_gate::config::{PipelineConfig, SandboxConfig};
use deploy_gate::database::Database;
use deploy_gate::deploy::{DeployRequest, DeploymentOrchestrator, DeploymentStorage};
use deploy_gate::manifest::{Artifact, Manifest, LUA_BUNDLE_FORMAT};
use deploy_gate::platform::{Alias, ComputeProvisioner, ExecutionRegistry, RegistryError, VersionRef};
use deploy_gate::sandbox::SandboxVerifier;
use deploy_gate::token::{ExpectedIdentity, IssueRequest, TokenService, TokenSigner};
use deploy_gate::workflow::{Workflow, WorkflowStorage};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const WORKFLOW_ID: &str = "wf-abc123";
pub const OWNER_ID: &str = "owner-1";

pub const GOOD_BUNDLE: &str = r#"
local restate = require("restate")
local svc = restate.service{ name = "wf-abc123" }
return { handler = restate.endpoint():bind(svc):handler() }
"#;

/// Compute platform that only records what it was asked to do
#[derive(Default)]
pub struct FakeCompute {
    calls: Mutex<Vec<String>>,
    next_version: AtomicU64,
}

impl FakeCompute {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ComputeProvisioner for FakeCompute {
    async fn deploy_version(
        &self,
        function: &str,
        _artifact: &Artifact,
        _manifest: &Manifest,
    ) -> anyhow::Result<VersionRef> {
        let number = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.push(format!("deploy_version {}", function));
        Ok(VersionRef {
            function: function.to_string(),
            version: number.to_string(),
            endpoint: format!("fake://{}/{}", function, number),
        })
    }

    async fn set_alias(&self, alias: Alias, _version: &VersionRef) -> anyhow::Result<()> {
        self.push(format!("set_alias {}", alias));
        Ok(())
    }

    async fn delete_alias(&self, alias: Alias, _version: &VersionRef) -> anyhow::Result<()> {
        self.push(format!("delete_alias {}", alias));
        Ok(())
    }

    async fn delete_version(&self, version: &VersionRef) -> anyhow::Result<()> {
        self.push(format!("delete_version {}", version.version));
        Ok(())
    }
}

/// Registry that reports a fixed set of names and can be told to be down
pub struct FakeRegistry {
    reported: BTreeSet<String>,
    outages: AtomicU32,
    read_back_outages: AtomicU32,
    refuse: bool,
    calls: Mutex<Vec<String>>,
}

/// Consume one pending outage, if any are left
fn take_outage(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeRegistry {
    pub fn reporting(names: &[&str]) -> Self {
        Self {
            reported: names.iter().map(|n| n.to_string()).collect(),
            outages: AtomicU32::new(0),
            read_back_outages: AtomicU32::new(0),
            refuse: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// The next `count` registrations fail as unavailable
    pub fn with_outages(self, count: u32) -> Self {
        self.outages.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` read-backs fail as unavailable
    pub fn with_read_back_outages(self, count: u32) -> Self {
        self.read_back_outages.store(count, Ordering::SeqCst);
        self
    }

    /// Every registration is answered with a refusal
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ExecutionRegistry for FakeRegistry {
    async fn register(&self, endpoint: &VersionRef) -> Result<(), RegistryError> {
        if take_outage(&self.outages) {
            self.push("register unavailable".to_string());
            return Err(RegistryError::Unavailable("503 Service Unavailable".into()));
        }
        if self.refuse {
            self.push("register refused".to_string());
            return Err(RegistryError::Rejected("400 endpoint is not a service deployment".into()));
        }
        self.push(format!("register {}", endpoint.endpoint));
        Ok(())
    }

    async fn list_service_names(&self, _endpoint: &VersionRef) -> Result<BTreeSet<String>, RegistryError> {
        if take_outage(&self.read_back_outages) {
            self.push("list_service_names unavailable".to_string());
            return Err(RegistryError::Unavailable("connection reset".into()));
        }
        self.push("list_service_names".to_string());
        Ok(self.reported.clone())
    }

    async fn deregister(&self, endpoint: &VersionRef) -> Result<(), RegistryError> {
        self.push(format!("deregister {}", endpoint.endpoint));
        Ok(())
    }
}

/// A fully wired pipeline around the fakes
pub struct Gate {
    pub orchestrator: DeploymentOrchestrator,
    pub tokens: Arc<TokenService>,
    pub compute: Arc<FakeCompute>,
    pub registry: Arc<FakeRegistry>,
    pub audit_log: Arc<AuditLog>,
    _dir: tempfile::TempDir,
}

pub fn sandbox_config(timeout_ms: u64) -> SandboxConfig {
    SandboxConfig {
        timeout_ms,
        ..SandboxConfig::default()
    }
}

pub async fn gate(registry: FakeRegistry) -> Gate {
    gate_with(registry, sandbox_config(2_000)).await
}

pub async fn gate_with(registry: FakeRegistry, sandbox: SandboxConfig) -> Gate {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::in_memory().await.unwrap();
    let workflows = WorkflowStorage::new(db.pool());
    workflows
        .create_workflow(&Workflow::new(
            WORKFLOW_ID.into(),
            OWNER_ID.into(),
            "Order fulfilment".into(),
            vec!["staging".into(), "production".into()],
        ))
        .await
        .unwrap();

    let tokens = Arc::new(TokenService::new(TokenSigner::generate(), workflows));
    let compute = Arc::new(FakeCompute::default());
    let registry = Arc::new(registry);
    let audit_log = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());

    let orchestrator = DeploymentOrchestrator::new(
        Arc::clone(&tokens),
        Arc::new(SandboxVerifier::new(sandbox)),
        compute.clone(),
        registry.clone(),
        DeploymentStorage::new(db.pool()),
        Arc::clone(&audit_log),
        PipelineConfig {
            registry_max_retries: 2,
            registry_backoff_ms: 1,
            registry_backoff_max_ms: 4,
            registry_admin_url: None,
        },
    );

    Gate {
        orchestrator,
        tokens,
        compute,
        registry,
        audit_log,
        _dir: dir,
    }
}

pub fn expected_identity() -> ExpectedIdentity {
    ExpectedIdentity {
        service_name: WORKFLOW_ID.into(),
        entry_point: "main.lua".into(),
        handler_export: "handler".into(),
        max_services: 1,
        min_sdk_version: "1.0.0".into(),
    }
}

/// Issue a production token, rotating away any earlier one
pub async fn issue_token(tokens: &TokenService) -> String {
    tokens
        .issue(IssueRequest {
            workflow_id: WORKFLOW_ID.into(),
            owner_id: OWNER_ID.into(),
            environment: "production".into(),
            expected_identity: expected_identity(),
            rotate: true,
        })
        .await
        .unwrap()
        .token
}

/// Single-file bundle with a manifest that matches it
pub fn upload(token: String, source: &str) -> DeployRequest {
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
