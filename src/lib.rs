//! Deploy gate: secure deployment validation for workflow build artifacts
//!
//! An upload carries a Lua bundle, its manifest and a signed binding token. The
//! gate verifies the token, checks the manifest, determines the service
//! identity the bundle declares (statically, or by running it in a sandbox),
//! deploys it under a quarantine alias, confirms the identity against the
//! execution registry's own bookkeeping and only then promotes it.

pub mod config;
pub mod database;
pub mod error;

// Workflow identities and binding tokens
pub mod token;
pub mod workflow;

// Validation stages
pub mod analysis;
pub mod manifest;
pub mod sandbox;

// External collaborators: compute and execution registry
pub mod platform;

pub mod audit;
pub mod deploy;

// HTTP surface
pub mod api;
pub mod server;

pub use deploy::{DeployRequest, Deployment, DeploymentOrchestrator, DeploymentStatus};
pub use error::{ErrorKind, GateError, ValidationError};
pub use server::{create_app, start_server};
