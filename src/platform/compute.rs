//! In-process compute platform
//!
//! Keeps deployed bundles in memory under `local://{function}/{version}`
//! endpoints. Doubles as the service discovery backend of `LocalRegistry`:
//! probing an endpoint runs its bundle in the sandbox, like a real runtime
//! answering a discovery request.

use crate::manifest::{Artifact, Manifest};
use crate::platform::{Alias, ComputeProvisioner, ServiceDiscovery, VersionRef};
use crate::sandbox::SandboxVerifier;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredVersion {
    version: VersionRef,
    artifact: Artifact,
    manifest: Manifest,
}

#[derive(Debug, Default)]
struct ComputeState {
    /// Keyed by endpoint
    versions: HashMap<String, StoredVersion>,
    /// (function, alias) → endpoint
    aliases: HashMap<(String, Alias), String>,
    /// Last version number handed out per function
    counters: HashMap<String, u64>,
}

/// In-process compute platform
///
/// Keeps every deployed version and alias in memory. Service discovery runs
/// the stored bundle in the sandbox, the way a real endpoint would answer a
/// registry discovery request.
pub struct LocalCompute {
    state: RwLock<ComputeState>,
    sandbox: Arc<SandboxVerifier>,
    discovery_timeout: Duration,
}

impl LocalCompute {
    /// Create an empty platform; discovery runs get the sandbox's own timeout
    pub fn new(sandbox: Arc<SandboxVerifier>) -> Self {
        let discovery_timeout = sandbox.config().timeout();
        Self {
            state: RwLock::new(ComputeState::default()),
            sandbox,
            discovery_timeout,
        }
    }

    /// Version an alias currently routes to
    pub async fn alias_target(&self, function: &str, alias: Alias) -> Option<VersionRef> {
        let state = self.state.read().await;
        state
            .aliases
            .get(&(function.to_string(), alias))
            .and_then(|endpoint| state.versions.get(endpoint))
            .map(|stored| stored.version.clone())
    }

    /// Number of versions currently deployed across all functions
    pub async fn version_count(&self) -> usize {
        self.state.read().await.versions.len()
    }
}

#[async_trait]
impl ComputeProvisioner for LocalCompute {
    async fn deploy_version(
        &self,
        function: &str,
        artifact: &Artifact,
        manifest: &Manifest,
    ) -> Result<VersionRef> {
        let mut state = self.state.write().await;
        let number = {
            let counter = state.counters.entry(function.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let version = VersionRef {
            function: function.to_string(),
            version: number.to_string(),
            endpoint: format!("local://{}/{}", function, number),
        };
        state.versions.insert(
            version.endpoint.clone(),
            StoredVersion {
                version: version.clone(),
                artifact: artifact.clone(),
                manifest: manifest.clone(),
            },
        );

        tracing::info!("📦 Deployed {} version {}", function, version.version);
        Ok(version)
    }

    async fn set_alias(&self, alias: Alias, version: &VersionRef) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.versions.contains_key(&version.endpoint) {
            return Err(anyhow::anyhow!(
                "Cannot point {} at unknown version {}",
                alias,
                version.endpoint
            ));
        }
        state
            .aliases
            .insert((version.function.clone(), alias), version.endpoint.clone());

        tracing::info!("🔀 Alias {}:{} → version {}", version.function, alias, version.version);
        Ok(())
    }

    async fn delete_alias(&self, alias: Alias, version: &VersionRef) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (version.function.clone(), alias);
        if state.aliases.get(&key) == Some(&version.endpoint) {
            state.aliases.remove(&key);
        }
        Ok(())
    }

    async fn delete_version(&self, version: &VersionRef) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .aliases
            .iter()
            .any(|((_, alias), endpoint)| *alias == Alias::Production && *endpoint == version.endpoint)
        {
            return Err(anyhow::anyhow!(
                "Version {} is serving production traffic",
                version.endpoint
            ));
        }

        state.versions.remove(&version.endpoint);
        state.aliases.retain(|_, endpoint| *endpoint != version.endpoint);

        tracing::info!("🗑️ Deleted {} version {}", version.function, version.version);
        Ok(())
    }
}

#[async_trait]
impl ServiceDiscovery for LocalCompute {
    async fn discover(&self, endpoint: &str) -> Result<BTreeSet<String>> {
        let stored = self
            .state
            .read()
            .await
            .versions
            .get(endpoint)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No deployment behind endpoint {}", endpoint))?;

        let report = self
            .sandbox
            .run(
                &stored.artifact,
                &stored.manifest.entry_point,
                &stored.manifest.handler_export,
                self.discovery_timeout,
            )
            .await
            .map_err(|e| anyhow::anyhow!("Discovery of {} failed: {}", endpoint, e))?;

        Ok(report.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::manifest::LUA_BUNDLE_FORMAT;

    fn compute() -> LocalCompute {
        LocalCompute::new(Arc::new(SandboxVerifier::new(SandboxConfig::default())))
    }

    fn bundle() -> (Artifact, Manifest) {
        let artifact = Artifact::default().with_file(
            "main.lua",
            r#"
            local restate = require("restate")
            local svc = restate.service{ name = "wf-abc123" }
            return { handler = restate.endpoint():bind(svc):handler() }
            "#,
        );
        let manifest = Manifest {
            entry_point: "main.lua".into(),
            handler_export: "handler".into(),
            format: LUA_BUNDLE_FORMAT.into(),
            artifact_hash: artifact.hash(),
        };
        (artifact, manifest)
    }

    #[tokio::test]
    async fn versions_are_numbered_per_function() {
        let compute = compute();
        let (artifact, manifest) = bundle();
        let v1 = compute.deploy_version("wf-a", &artifact, &manifest).await.unwrap();
        let v2 = compute.deploy_version("wf-a", &artifact, &manifest).await.unwrap();
        let other = compute.deploy_version("wf-b", &artifact, &manifest).await.unwrap();

        assert_eq!((v1.version.as_str(), v2.version.as_str()), ("1", "2"));
        assert_eq!(other.endpoint, "local://wf-b/1");
    }

    #[tokio::test]
    async fn aliases_follow_versions_and_cleanup() {
        let compute = compute();
        let (artifact, manifest) = bundle();
        let v1 = compute.deploy_version("wf-a", &artifact, &manifest).await.unwrap();

        compute.set_alias(Alias::Quarantine, &v1).await.unwrap();
        assert_eq!(compute.alias_target("wf-a", Alias::Quarantine).await, Some(v1.clone()));

        compute.delete_alias(Alias::Quarantine, &v1).await.unwrap();
        compute.delete_version(&v1).await.unwrap();
        assert_eq!(compute.alias_target("wf-a", Alias::Quarantine).await, None);
        assert_eq!(compute.version_count().await, 0);
    }

    #[tokio::test]
    async fn production_version_cannot_be_deleted() {
        let compute = compute();
        let (artifact, manifest) = bundle();
        let v1 = compute.deploy_version("wf-a", &artifact, &manifest).await.unwrap();
        compute.set_alias(Alias::Production, &v1).await.unwrap();

        assert!(compute.delete_version(&v1).await.is_err());
    }

    #[tokio::test]
    async fn discovery_runs_the_deployed_bundle() {
        let compute = compute();
        let (artifact, manifest) = bundle();
        let v1 = compute.deploy_version("wf-a", &artifact, &manifest).await.unwrap();

        let names = compute.discover(&v1.endpoint).await.unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["wf-abc123".to_string()]);
        assert!(compute.discover("local://wf-a/99").await.is_err());
    }
}
