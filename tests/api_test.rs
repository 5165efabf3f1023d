//! HTTP surface exercised over a real listener

mod common;

use common::{expected_identity, GOOD_BUNDLE, OWNER_ID, WORKFLOW_ID};
use deploy_gate::config::Config;
use deploy_gate::create_app;
use deploy_gate::manifest::{Artifact, LUA_BUNDLE_FORMAT};
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct Server {
    base: String,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl Server {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.data_dir = dir.path().join("data").to_string_lossy().into_owned();
        config.token.signing_key_path = dir.path().join("binding_key.hex").to_string_lossy().into_owned();
        config.pipeline.registry_admin_url = None;
        config.pipeline.registry_backoff_ms = 1;

        let app = create_app(config).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn create_workflow(&self) {
        let (status, _) = self
            .post(
                "/api/workflows",
                json!({
                    "id": WORKFLOW_ID,
                    "ownerId": OWNER_ID,
                    "name": "Order fulfilment",
                    "environments": ["production"],
                }),
            )
            .await;
        assert_eq!(status, 201);
    }

    async fn issue_token(&self, rotate: bool) -> (u16, Value) {
        self.post(
            &format!("/api/workflows/{}/tokens", WORKFLOW_ID),
            json!({
                "ownerId": OWNER_ID,
                "environment": "production",
                "expectedIdentity": expected_identity(),
                "rotate": rotate,
            }),
        )
        .await
    }

    async fn deploy(&self, token: &str) -> (u16, Value) {
        let artifact = Artifact::default().with_file("main.lua", GOOD_BUNDLE);
        self.post(
            "/api/deployments",
            json!({
                "token": token,
                "manifest": {
                    "entryPoint": "main.lua",
                    "handlerExport": "handler",
                    "format": LUA_BUNDLE_FORMAT,
                    "artifactHash": artifact.hash(),
                },
                "artifact": artifact,
                "createdBy": "ci",
            }),
        )
        .await
    }
}

#[tokio::test]
async fn health_and_public_key_are_served() {
    let server = Server::start().await;

    let health = server
        .client
        .get(format!("{}/healthz", server.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "ok");

    let (status, key) = server.get("/.well-known/binding-key").await;
    assert_eq!(status, 200);
    assert_eq!(key["algorithm"], "Ed25519");
    assert_eq!(key["publicKey"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn upload_is_promoted_and_audited() {
    let server = Server::start().await;
    server.create_workflow().await;

    let (status, issued) = server.issue_token(false).await;
    assert_eq!(status, 201);
    let token = issued["token"].as_str().unwrap().to_string();

    let (status, deployment) = server.deploy(&token).await;
    assert_eq!(status, 201);
    assert_eq!(deployment["status"], "promoted");
    assert_eq!(deployment["alias"], "production");

    let id = deployment["id"].as_str().unwrap();
    let (status, stored) = server.get(&format!("/api/deployments/{}", id)).await;
    assert_eq!(status, 200);
    assert_eq!(stored["status"], "promoted");

    let (_, audit) = server.get(&format!("/api/audit?deploymentId={}", id)).await;
    let records = audit["records"].as_array().unwrap();
    assert_eq!(records.first().unwrap()["stage"], "upload");
    assert_eq!(records.last().unwrap()["stage"], "promote");

    let (_, workflow) = server.get(&format!("/api/workflows/{}", WORKFLOW_ID)).await;
    assert_eq!(workflow["deployments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn errors_name_their_kind() {
    let server = Server::start().await;
    server.create_workflow().await;

    let (status, body) = server
        .post(
            "/api/workflows",
            json!({ "id": WORKFLOW_ID, "ownerId": OWNER_ID, "name": "again", "environments": ["production"] }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["kind"], "Conflict");

    server.issue_token(false).await;
    let (status, body) = server.issue_token(false).await;
    assert_eq!(status, 409);
    assert_eq!(body["kind"], "IdentityConflict");

    let (status, body) = server.get("/api/deployments/dep-missing").await;
    assert_eq!(status, 404);
    assert_eq!(body["kind"], "NotFound");

    let (status, body) = server.post("/api/workflows/wf-missing/rotate", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["kind"], "TokenUnknownWorkflow");
}

#[tokio::test]
async fn rotation_and_archive_revoke_tokens() {
    let server = Server::start().await;
    server.create_workflow().await;

    let (_, issued) = server.issue_token(false).await;
    let old = issued["token"].as_str().unwrap().to_string();

    let (status, _) = server
        .post(&format!("/api/workflows/{}/rotate", WORKFLOW_ID), json!({}))
        .await;
    assert_eq!(status, 200);

    let (status, deployment) = server.deploy(&old).await;
    assert_eq!(status, 201);
    assert_eq!(deployment["status"], "failed");
    assert_eq!(deployment["errorKind"], "TokenRevoked");

    let (_, issued) = server.issue_token(false).await;
    let fresh = issued["token"].as_str().unwrap().to_string();

    let response = server
        .client
        .delete(format!("{}/api/workflows/{}", server.base, WORKFLOW_ID))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let (_, deployment) = server.deploy(&fresh).await;
    assert_eq!(deployment["status"], "failed");
    assert_eq!(deployment["errorKind"], "TokenUnknownWorkflow");

    let (_, workflow) = server.get(&format!("/api/workflows/{}", WORKFLOW_ID)).await;
    assert!(!workflow["workflow"]["archivedAt"].is_null());
}
