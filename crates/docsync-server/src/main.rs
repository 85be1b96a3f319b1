//! docsync sync server.
//!
//! This server:
//! - Accepts WebSocket sync sessions on /sync/{workspace_id}/{doc_id}
//! - Serializes document mutations through a distributed lock
//! - Persists documents to the local filesystem
//! - Flushes documents and releases held locks on shutdown

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use docsync_concurrency::{ConcurrencyConfig, ConcurrencyService};
use docsync_core::{KvStore, LockConfig, LockProvider};
use docsync_local::{FileKvStore, FsDocumentStore, MemoryKvStore};
use docsync_server::{
    health_handler, sync_handler, AppState, Config, LockStoreKind, SyncCoordinator,
    UpdateLogMerge,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let data_dir = config.data_dir();

    info!("Starting docsync-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Data dir: {}", data_dir.display());

    let kv: Arc<dyn KvStore> = match config.lock_store {
        LockStoreKind::Memory => {
            warn!("  Lock store: memory (locks only exclude within this instance)");
            Arc::new(MemoryKvStore::new())
        }
        LockStoreKind::File => {
            let lock_dir = config.lock_dir();
            info!("  Lock store: file ({})", lock_dir.display());
            Arc::new(FileKvStore::new(lock_dir)?)
        }
    };
    info!(
        "  Lock TTL: {}s, max wait: {}ms",
        config.lock_ttl_secs, config.max_wait_ms
    );

    let provider = Arc::new(LockProvider::new(
        kv,
        LockConfig {
            ttl: config.lock_ttl(),
            ..LockConfig::default()
        },
    )?);
    let concurrency = ConcurrencyService::new(
        provider,
        ConcurrencyConfig {
            default_max_wait: config.max_wait(),
            shutdown_grace: config.shutdown_grace(),
        },
    );
    let documents = Arc::new(FsDocumentStore::new(&data_dir));
    let coordinator = Arc::new(SyncCoordinator::new(
        concurrency,
        Arc::new(UpdateLogMerge),
        documents,
    ));
    info!("  Merge engine: {}", coordinator.merge_name());

    let state = AppState {
        coordinator: Arc::clone(&coordinator),
    };

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/sync/{workspace_id}/{doc_id}", get(sync_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind and serve
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on ws://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
        info!("Received SIGTERM, initiating shutdown");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
