//! Funnelflow control plane server.
//!
//! Serves the configuration and run ledger API, ingests events and executes
//! workflow runs in the background.

use funnelflow_actions::apps::default_registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use funnelflow_control_plane::{
    config::{AppConfig, DatabaseConfig, StoreBackend},
    crypto::CredentialCipher,
    db::{create_pool, run_migrations},
    engine::Engine,
    handlers,
    nats::RunPublisher,
    state::AppState,
    store::{MemoryStore, PgStore, Store},
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,funnelflow_control_plane=debug,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Open the configured store.
async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let db_config = DatabaseConfig::from_env()?;
            let pool = create_pool(&db_config).await?;
            run_migrations(&pool).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
    }
}

/// Connect the run publisher if NATS is configured.
async fn connect_nats(config: &AppConfig) -> Option<RunPublisher> {
    let Some(ref nats_url) = config.nats_url else {
        tracing::info!("NATS not configured, running without run notifications");
        return None;
    };
    match RunPublisher::connect(nats_url).await {
        Ok(publisher) => {
            tracing::info!(url = %nats_url, "Connected to NATS");
            Some(publisher)
        }
        Err(e) => {
            tracing::warn!(error = %e, url = %nats_url, "Failed to connect to NATS, continuing without it");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load app config ({e}), using defaults");
        AppConfig::default()
    });

    init_tracing(app_config.log_json);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %app_config.host,
        port = app_config.port,
        store = ?app_config.store,
        worker_concurrency = app_config.worker_concurrency,
        "Starting Funnelflow control plane"
    );

    let store = open_store(&app_config).await?;
    let cipher = CredentialCipher::from_config(app_config.encryption_key.as_deref())?;
    let publisher = connect_nats(&app_config).await;

    let (state, worker) = AppState::new(
        store.clone(),
        Arc::new(default_registry()),
        cipher,
        app_config.clone(),
        publisher,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = worker.spawn(shutdown_rx.clone());
    let sweeper_handle = Engine::sweeper(store, &app_config).spawn(shutdown_rx);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::router(&state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(worker_handle, sweeper_handle);

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
