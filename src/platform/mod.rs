//! External collaborators of the pipeline
//!
//! The compute platform that hosts function versions and the durable-execution
//! registry that discovers services behind an endpoint. The orchestrator only
//! sees the traits; in-process implementations back local runs and tests, and
//! `RestateRegistry` talks to a real admin API.

use crate::manifest::{Artifact, Manifest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod compute;
pub mod registry;
pub mod restate;

pub use compute::LocalCompute;
pub use registry::LocalRegistry;
pub use restate::RestateRegistry;

/// Handle to one immutable deployed function version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRef {
    /// Compute function name (one per workflow)
    pub function: String,
    pub version: String,
    /// Invocation URI the registry discovers services through
    pub endpoint: String,
}

/// Traffic alias on a compute function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alias {
    /// Provisioned but not serving production traffic
    Quarantine,
    Production,
}

impl Alias {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alias::Quarantine => "quarantine",
            Alias::Production => "production",
        }
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Transient: connection failures, timeouts, 5xx
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The registry answered and refused
    #[error("registry rejected the request: {0}")]
    Rejected(String),
}

/// Compute provisioning contract
#[async_trait]
pub trait ComputeProvisioner: Send + Sync {
    async fn deploy_version(
        &self,
        function: &str,
        artifact: &Artifact,
        manifest: &Manifest,
    ) -> anyhow::Result<VersionRef>;

    /// Atomically point `alias` at `version`
    async fn set_alias(&self, alias: Alias, version: &VersionRef) -> anyhow::Result<()>;

    /// Remove `alias` if it still points at `version`
    async fn delete_alias(&self, alias: Alias, version: &VersionRef) -> anyhow::Result<()>;

    async fn delete_version(&self, version: &VersionRef) -> anyhow::Result<()>;
}

/// External execution registry contract; its read-back is authoritative
#[async_trait]
pub trait ExecutionRegistry: Send + Sync {
    async fn register(&self, endpoint: &VersionRef) -> Result<(), RegistryError>;

    async fn list_service_names(&self, endpoint: &VersionRef) -> Result<BTreeSet<String>, RegistryError>;

    async fn deregister(&self, endpoint: &VersionRef) -> Result<(), RegistryError>;
}

/// What a registry learns when it queries an endpoint
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn discover(&self, endpoint: &str) -> anyhow::Result<BTreeSet<String>>;
}
