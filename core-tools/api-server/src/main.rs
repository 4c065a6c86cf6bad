// Ragtime HTTP server
// Serves the experiment API on the configured host and port

use anyhow::Context;
use ragtime_api_server::{router, AppState};
use ragtime_engine::config::Config;
use ragtime_engine::db::Database;
use ragtime_engine::secrets::CredentialStore;
use ragtime_engine::telemetry::init_telemetry_with_level;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var_os("RAGTIME_CONFIG") {
        Some(path) => Config::load_from_path(std::path::Path::new(&path))?,
        None => Config::load_or_create()?,
    };
    init_telemetry_with_level(&config.core.log_level);

    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open database")?;
    let credentials = Arc::new(CredentialStore::new(database.api_keys()));
    credentials
        .refresh()
        .await
        .context("Failed to load stored API keys")?;

    let app = router(AppState::from_config(&config, credentials));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!("Ragtime API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("API server shutting down gracefully");
        })
        .await
        .context("API server error")?;

    Ok(())
}
