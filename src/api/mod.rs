//! HTTP API layer
//!
//! Thin axum handlers over the token service and the deployment pipeline.
//! Every error body names its kind: `{ "kind": "TokenRevoked", "message": "..." }`.

pub mod deployments;
pub mod workflows;

use crate::audit::AuditLog;
use crate::deploy::DeploymentOrchestrator;
use crate::error::{ErrorKind, GateError, ValidationError};
use crate::token::TokenService;
use crate::workflow::WorkflowStorage;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

pub use deployments::create_deployment_routes;
pub use workflows::create_workflow_routes;

/// Shared handles for every handler
#[derive(Clone)]
pub struct AppState {
    pub workflows: WorkflowStorage,
    pub tokens: Arc<TokenService>,
    pub orchestrator: DeploymentOrchestrator,
    pub audit_log: Arc<AuditLog>,
}

/// Error response with a machine-readable kind
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", message)
    }

    pub fn internal(e: anyhow::Error) -> Self {
        tracing::error!("❌ Internal error: {}", e);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", e.to_string())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::TokenInvalid | ErrorKind::TokenRevoked => StatusCode::UNAUTHORIZED,
        ErrorKind::TokenUnknownWorkflow => StatusCode::NOT_FOUND,
        ErrorKind::IdentityConflict => StatusCode::CONFLICT,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::RegistryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Rejected(e) => {
                let kind = e.kind();
                tracing::warn!("⛔ {}", e);
                Self::new(status_for(kind), kind.as_str(), e.to_string())
            }
            GateError::Internal(e) => Self::internal(e),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        GateError::from(err).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "kind": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_client_errors() {
        let err = ApiError::from(GateError::from(ValidationError::TokenRevoked("rotated".into())));
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.kind, "TokenRevoked");

        let err = ApiError::from(GateError::from(ValidationError::IdentityConflict("active".into())));
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = ApiError::from(GateError::from(anyhow::anyhow!("disk full")));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind, "Internal");
    }
}
