//! Deploy gate server binary
//!
//! Configuration comes from `DEPLOY_GATE_*` environment variables; see
//! `Config::default`.

use deploy_gate::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
