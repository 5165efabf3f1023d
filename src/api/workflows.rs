//! Workflow identity and binding token endpoints

use crate::api::{ApiError, AppState};
use crate::error::ValidationError;
use crate::token::{ExpectedIdentity, IssueRequest, IssuedToken};
use crate::workflow::Workflow;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

/// Request body for workflow creation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub environments: Vec<String>,
}

/// Request body for token issuance; the workflow comes from the path
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTokenRequest {
    pub owner_id: String,
    pub environment: String,
    pub expected_identity: ExpectedIdentity,
    #[serde(default)]
    pub rotate: bool,
}

/// Create workflow routes
///
/// Workflow identity records, token issue and rotation, archiving, and the
/// public key verifiers need to check binding tokens.
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow))
        .route("/api/workflows/{id}", get(get_workflow).delete(archive_workflow))
        .route("/api/workflows/{id}/tokens", post(issue_token))
        .route("/api/workflows/{id}/rotate", post(rotate_tokens))
        .route("/.well-known/binding-key", get(binding_key))
}

/// GET /.well-known/binding-key
///
/// Public half of the token signing key, for verifiers outside the gate.
async fn binding_key(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "algorithm": "Ed25519",
        "publicKey": state.tokens.verifier().public_hex(),
    }))
}

/// POST /api/workflows
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    if payload.id.trim().is_empty() || payload.owner_id.trim().is_empty() {
        return Err(ValidationError::InvalidRequest("id and ownerId are required".into()).into());
    }
    if payload.environments.is_empty() {
        return Err(ValidationError::InvalidRequest("at least one environment is required".into()).into());
    }

    let workflow = Workflow::new(payload.id, payload.owner_id, payload.name, payload.environments);
    if !state.workflows.create_workflow(&workflow).await? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "Conflict",
            format!("workflow {} already exists", workflow.id),
        ));
    }

    tracing::info!("🆕 Created workflow: {} ({})", workflow.id, workflow.name);
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// GET /api/workflows/{id}
///
/// Returns the workflow together with its deployment history, newest first.
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let workflow = state
        .workflows
        .get_workflow(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow {} not found", id)))?;
    let deployments = state.orchestrator.list_for_workflow(&id).await?;

    Ok(Json(json!({ "workflow": workflow, "deployments": deployments })))
}

/// DELETE /api/workflows/{id}
///
/// Archives rather than deletes; the record stays for forensics.
async fn archive_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let archived_at = state.tokens.archive(&id).await?;
    Ok(Json(json!({ "workflowId": id, "archivedAt": archived_at })))
}

/// POST /api/workflows/{id}/tokens
async fn issue_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<IssuedToken>), ApiError> {
    let issued = state
        .tokens
        .issue(IssueRequest {
            workflow_id: id,
            owner_id: payload.owner_id,
            environment: payload.environment,
            expected_identity: payload.expected_identity,
            rotate: payload.rotate,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

/// POST /api/workflows/{id}/rotate
async fn rotate_tokens(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let rotated_at = state.tokens.rotate(&id).await?;
    Ok(Json(json!({ "workflowId": id, "rotatedAt": rotated_at })))
}
