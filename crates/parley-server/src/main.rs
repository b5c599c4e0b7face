mod config;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use parley_api::auth::TokenKeys;
use parley_api::{AppStateInner, build_router};
use parley_db::Database;
use parley_gateway::{Gateway, Hub};

use crate::config::Config;

/// Pending hub requests before producers have to wait.
const HUB_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let addr = config.addr()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    let (hub, hub_task) = Hub::spawn(HUB_QUEUE);
    let gateway = Gateway::new(hub, db, config.connection.clone());
    let state = AppStateInner::new(gateway.clone(), TokenKeys::new(&config.jwt_secret));
    let app = build_router(state);

    info!("Parley server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Stop accepting and start draining sockets on the same signal
    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            stop.cancel();
        }
    });

    let grace = config.shutdown_grace;
    let drain = tokio::spawn({
        let stop = stop.clone();
        let gateway = gateway.clone();
        async move {
            stop.cancelled().await;
            if !gateway.shutdown(grace).await {
                info!("Grace period over, closing remaining connections");
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(stop.cancelled_owned())
        .await?;

    let _ = drain.await;
    let _ = hub_task.await;
    info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
