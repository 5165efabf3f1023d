//! In-process execution registry using ArcSwap
//!
//! Registration queries the endpoint through a `ServiceDiscovery` and records
//! the services it reports. The endpoint → services map is replaced wholesale
//! on every change, so read-backs never block behind a registration.

use crate::platform::{ExecutionRegistry, RegistryError, ServiceDiscovery, VersionRef};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Execution registry held in process memory
///
/// Readers load the current map without locking; writers publish a new map
/// with `rcu`.
pub struct LocalRegistry {
    /// Key: endpoint URI, Value: service names discovered behind it
    services: ArcSwap<HashMap<String, BTreeSet<String>>>,
    discovery: Arc<dyn ServiceDiscovery>,
}

impl LocalRegistry {
    /// Create an empty registry that queries endpoints through `discovery`
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            services: ArcSwap::new(Arc::new(HashMap::new())),
            discovery,
        }
    }

    /// Number of registered endpoints (lock-free read)
    pub fn len(&self) -> usize {
        self.services.load().len()
    }

    /// Whether no endpoint is registered
    pub fn is_empty(&self) -> bool {
        self.services.load().is_empty()
    }
}

#[async_trait]
impl ExecutionRegistry for LocalRegistry {
    async fn register(&self, endpoint: &VersionRef) -> Result<(), RegistryError> {
        let names = self
            .discovery
            .discover(&endpoint.endpoint)
            .await
            .map_err(|e| RegistryError::Rejected(e.to_string()))?;

        let uri = endpoint.endpoint.clone();
        self.services.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(uri.clone(), names.clone());
            next
        });

        tracing::info!("📝 Registered {} with services {:?}", endpoint.endpoint, names);
        Ok(())
    }

    async fn list_service_names(&self, endpoint: &VersionRef) -> Result<BTreeSet<String>, RegistryError> {
        Ok(self
            .services
            .load()
            .get(&endpoint.endpoint)
            .cloned()
            .unwrap_or_default())
    }

    async fn deregister(&self, endpoint: &VersionRef) -> Result<(), RegistryError> {
        if self.services.load().contains_key(&endpoint.endpoint) {
            self.services.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.remove(&endpoint.endpoint);
                next
            });
            tracing::info!("🧹 Deregistered {}", endpoint.endpoint);
        }
        Ok(())
    }
}
