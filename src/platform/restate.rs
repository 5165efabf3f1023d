//! HTTP client for a Restate-style admin API
//!
//! `POST /deployments` registers an endpoint and triggers discovery,
//! `GET /deployments/{id}` reads back the services the registry recorded and
//! `DELETE /deployments/{id}?force=true` removes it. Connection failures and
//! 5xx answers are `Unavailable`; other non-success answers are `Rejected`.

use crate::platform::{ExecutionRegistry, RegistryError, VersionRef};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    uri: &'a str,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct DeploymentResponse {
    id: String,
    #[serde(default)]
    services: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
}

/// Registry client for a Restate-style admin API
///
/// Remembers the registry's deployment id for each endpoint it registered so
/// read-back and deregistration address the same deployment.
pub struct RestateRegistry {
    http: reqwest::Client,
    admin_url: String,
    /// Endpoint URI → registry deployment id
    deployments: ArcSwap<HashMap<String, String>>,
}

impl RestateRegistry {
    /// Create a client for the admin API at `admin_url`
    pub fn new(admin_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build registry client: {}", e))?;

        Ok(Self {
            http,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            deployments: ArcSwap::new(Arc::new(HashMap::new())),
        })
    }

    fn deployment_id(&self, endpoint: &VersionRef) -> Option<String> {
        self.deployments.load().get(&endpoint.endpoint).cloned()
    }

    async fn read_deployment(&self, response: reqwest::Response) -> Result<DeploymentResponse, RegistryError> {
        let response = check_status(response).await?;
        response
            .json::<DeploymentResponse>()
            .await
            .map_err(|e| RegistryError::Rejected(format!("malformed registry response: {}", e)))
    }
}

fn transport_error(e: reqwest::Error) -> RegistryError {
    RegistryError::Unavailable(e.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(RegistryError::Unavailable(format!("{}: {}", status, body)))
    } else {
        Err(RegistryError::Rejected(format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl ExecutionRegistry for RestateRegistry {
    async fn register(&self, endpoint: &VersionRef) -> Result<(), RegistryError> {
        let response = self
            .http
            .post(format!("{}/deployments", self.admin_url))
            .json(&RegisterRequest {
                uri: &endpoint.endpoint,
                force: false,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let deployment = self.read_deployment(response).await?;

        let uri = endpoint.endpoint.clone();
        let id = deployment.id.clone();
        self.deployments.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(uri.clone(), id.clone());
            next
        });

        tracing::info!("📝 Registry deployment {} created for {}", deployment.id, endpoint.endpoint);
        Ok(())
    }

    async fn list_service_names(&self, endpoint: &VersionRef) -> Result<BTreeSet<String>, RegistryError> {
        let id = self.deployment_id(endpoint).ok_or_else(|| {
            RegistryError::Rejected(format!("{} was never registered", endpoint.endpoint))
        })?;

        let response = self
            .http
            .get(format!("{}/deployments/{}", self.admin_url, id))
            .send()
            .await
            .map_err(transport_error)?;
        let deployment = self.read_deployment(response).await?;

        Ok(deployment.services.into_iter().map(|s| s.name).collect())
    }

    async fn deregister(&self, endpoint: &VersionRef) -> Result<(), RegistryError> {
        let Some(id) = self.deployment_id(endpoint) else {
            return Ok(());
        };

        let response = self
            .http
            .delete(format!("{}/deployments/{}", self.admin_url, id))
            .query(&[("force", "true")])
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() != StatusCode::NOT_FOUND {
            check_status(response).await?;
        }

        let uri = endpoint.endpoint.clone();
        self.deployments.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&uri);
            next
        });

        tracing::info!("🧹 Registry deployment {} removed", id);
        Ok(())
    }
}
