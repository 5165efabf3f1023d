//! Deployment upload and audit endpoints

use crate::api::{ApiError, AppState};
use crate::audit::{AuditQuery, AuditRecord};
use crate::deploy::{DeployRequest, Deployment};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

/// Create deployment routes
///
/// Uploads run the full pipeline before answering; the audit query reads the
/// JSONL trail filtered by deployment or artifact hash.
pub fn create_deployment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/deployments", post(create_deployment))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/audit", get(query_audit))
}

/// POST /api/deployments
///
/// Body: `{ "token": "...", "manifest": {...}, "artifact": { "files": {...} } }`.
/// Runs the whole pipeline and answers with the terminal record; a rejected
/// upload is still `201` with `status` `failed` or `rolled_back` and the
/// taxonomy kind in `errorKind`.
async fn create_deployment(
    State(state): State<AppState>,
    Json(payload): Json<DeployRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    tracing::info!(
        "📥 Deployment upload from {} ({} files)",
        payload.created_by,
        payload.artifact.files.len()
    );
    let deployment = state.orchestrator.deploy(payload).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

/// GET /api/deployments/{id}
async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    state
        .orchestrator
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("deployment {} not found", id)))
}

/// GET /api/audit?deploymentId=..&artifactHash=..
async fn query_audit(
    State(state): State<AppState>,
    Query(filter): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let records: Vec<AuditRecord> = state.audit_log.query(&filter).await?;
    Ok(Json(json!({ "records": records })))
}
