use std::sync::Arc;

use anyhow::Context;
use farmhand::config::{LabourConfig, ServerConfig};
use farmhand::labour::{
    InMemoryWorkerDirectory, LabourService, SystemClock, WorkerDirectory, labour_routes,
    spawn_shortfall_sweep,
};
use farmhand::store::{LabourStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env();
    let labour = LabourConfig::from_env();
    labour.validate().context("invalid labour configuration")?;

    eprintln!("🌾 Farmhand v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/requests", server.port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws/events", server.port);
    eprintln!(
        "   Shortfall window: {}h (sweep every {}s)",
        labour.shortfall_window.as_secs() / 3600,
        labour.sweep_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn LabourStore> = Arc::new(
        LibSqlBackend::new_local(&server.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", server.db_path.display()))?,
    );
    eprintln!("   Database: {}", server.db_path.display());

    // ── Worker directory ─────────────────────────────────────────────────
    let directory = match &server.workers_file {
        Some(path) => InMemoryWorkerDirectory::load_json(path)
            .await
            .with_context(|| format!("failed to load worker roster {}", path.display()))?,
        None => {
            tracing::warn!("FARMHAND_WORKERS_FILE not set, starting with an empty worker roster");
            InMemoryWorkerDirectory::new()
        }
    };
    if let Some(path) = &server.coordinators_file {
        let count = directory
            .load_coordinators_json(path)
            .await
            .with_context(|| format!("failed to load coordinators {}", path.display()))?;
        eprintln!("   Coordinators: {count}");
    }
    eprintln!("   Workers: {}", directory.len().await);
    let directory: Arc<dyn WorkerDirectory> = Arc::new(directory);

    // ── Service ──────────────────────────────────────────────────────────
    let sweep_interval = labour.sweep_interval;
    let service = Arc::new(LabourService::new(
        store,
        directory,
        Arc::new(SystemClock),
        labour,
    ));
    let _sweep_handle = spawn_shortfall_sweep(Arc::clone(&service), sweep_interval);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = labour_routes(service);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, "Farmhand server started");
    axum::serve(listener, app).await?;

    Ok(())
}
