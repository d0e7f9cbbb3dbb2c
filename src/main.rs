use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cluster_session_store::config::{ClusterBackend, Settings};
use cluster_session_store::redis::{ConnectionFactory, MemoryCluster, RedisClusterFactory};
use cluster_session_store::server::{create_app, AppState, RequestHook, SessionManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    match settings.cluster.backend {
        ClusterBackend::Redis => {
            let factory = RedisClusterFactory::new(&settings.cluster)?;
            tracing::info!(nodes = ?factory.nodes(), "Using Redis Cluster session storage");
            run(settings, factory).await
        }
        ClusterBackend::Memory => {
            tracing::warn!("Using in-process session storage, sessions are not shared between instances");
            run(settings, MemoryCluster::new()).await
        }
    }
}

async fn run<F: ConnectionFactory + Clone>(settings: Settings, factory: F) -> Result<()> {
    // Start the session store and bind it to the request pipeline
    let hook = Arc::new(RequestHook::new());
    let mut manager = SessionManager::new(settings.clone(), factory);
    manager.start(Some(hook.clone()))?;

    let state = AppState::new(settings.clone(), hook);
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    manager.stop();
    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
