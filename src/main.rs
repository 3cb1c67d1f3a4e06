use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod api;
mod backup;
mod storage;
mod utils;
mod web;

use crate::api::AppState;
use crate::backup::{BackupManager, SystemLauncher};
use crate::storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    // Load configuration
    let config = utils::config::load_config()?;

    info!("Starting Mirror Guard v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Deletion gate: {} files and {}% of source",
        config.deletion_threshold_count, config.deletion_threshold_percent
    );

    match backup::rsync::check_rsync(&config.rsync_path).await {
        Ok(version) => info!("Using {}", version),
        Err(e) => warn!("rsync is not usable at {}: {:#}", config.rsync_path.display(), e),
    }

    // Initialize storage layer
    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    let manager = BackupManager::new(
        config.clone(),
        Arc::new(SystemLauncher),
        Arc::new(storage.clone()),
    );

    let state = AppState {
        manager: manager.clone(),
        storage,
    };

    // Build the API router
    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
