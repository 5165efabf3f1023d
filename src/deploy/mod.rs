//! Deployment state machine and pipeline

pub mod orchestrator;
pub mod state;
pub mod storage;
pub mod types;

pub use orchestrator::{DeployRequest, DeploymentOrchestrator};
pub use state::{Transition, Validating, Verified};
pub use storage::DeploymentStorage;
pub use types::{Deployment, DeploymentStatus};
