//! Server setup and initialization
//!
//! Wires the components together: database, token service, sandbox, compute and
//! registry collaborators, audit log, pipeline and HTTP routes.

use crate::{
    api::{create_deployment_routes, create_workflow_routes, AppState},
    audit::AuditLog,
    config::Config,
    database::Database,
    deploy::{DeploymentOrchestrator, DeploymentStorage},
    platform::{ExecutionRegistry, LocalCompute, LocalRegistry, RestateRegistry},
    sandbox::SandboxVerifier,
    token::{TokenService, TokenSigner},
    workflow::WorkflowStorage,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Build every component and the shared handler state
pub async fn create_state(config: &Config) -> Result<AppState> {
    tracing::info!("📁 Data directory: {}", config.database.data_dir);
    let database = Database::connect(&config.database.data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open gate database: {}", e))?;

    tracing::info!("🔑 Loading token signing key");
    let signer = TokenSigner::load_or_generate(Path::new(&config.token.signing_key_path))?;
    let workflows = WorkflowStorage::new(database.pool());
    let tokens = Arc::new(TokenService::new(signer, workflows.clone()));

    tracing::info!(
        "🧪 Sandbox: timeout={}ms memory={}B concurrency={} modules={:?}",
        config.sandbox.timeout_ms,
        config.sandbox.memory_limit_bytes,
        config.sandbox.max_concurrent,
        config.sandbox.allowed_modules
    );
    let sandbox = Arc::new(SandboxVerifier::new(config.sandbox.clone()));
    let compute = Arc::new(LocalCompute::new(Arc::clone(&sandbox)));

    let registry: Arc<dyn ExecutionRegistry> = match &config.pipeline.registry_admin_url {
        Some(url) => {
            tracing::info!("📡 Using execution registry at {}", url);
            Arc::new(RestateRegistry::new(url)?)
        }
        None => {
            tracing::info!("📡 Using in-process execution registry");
            Arc::new(LocalRegistry::new(compute.clone()))
        }
    };

    let audit_log =
        Arc::new(AuditLog::open(Path::new(&config.database.data_dir).join("audit.jsonl")).await?);

    let orchestrator = DeploymentOrchestrator::new(
        Arc::clone(&tokens),
        sandbox,
        compute,
        registry,
        DeploymentStorage::new(database.pool()),
        Arc::clone(&audit_log),
        config.pipeline.clone(),
    );

    Ok(AppState {
        workflows,
        tokens,
        orchestrator,
        audit_log,
    })
}

/// Create the Axum application with all routes
pub async fn create_app(config: Config) -> Result<Router> {
    let state = create_state(&config).await?;

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_deployment_routes())
        .with_state(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    let level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    // A subscriber may already be installed by an embedding process
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_max_level(level)
        .try_init();

    tracing::info!("Starting deploy gate...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
