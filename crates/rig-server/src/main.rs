use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rig_server::config::ServerConfig;
use rig_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;

    if config.log_format == "json" {
        rig_common::logging::init_tracing_json();
    } else {
        rig_common::logging::init_tracing();
    }

    info!(bind_addr = %config.bind_addr, rig_dir = %config.rig_dir.display(), "starting rig-server");

    tokio::fs::create_dir_all(config.rig_dir.join("cache")).await?;
    tokio::fs::create_dir_all(config.rig_dir.join("logs")).await?;

    let refresh_interval = config.refresh_interval;
    let cache_dir = config.rig_dir.join("cache");

    let state = AppState::new(config);
    let app = rig_server::create_router(state.clone());

    let refresher_cancel = CancellationToken::new();
    let refresher = rig_artifacts::Refresher::new(cache_dir, refresh_interval);
    let refresher_task = {
        let cancel = refresher_cancel.clone();
        tokio::spawn(async move {
            refresher.run(cancel).await;
        })
    };

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr).await?;
    info!("rig-server listening on {}", state.config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    refresher_cancel.cancel();
    let _ = refresher_task.await;

    info!("rig-server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C, shutting down..."),
        _ = terminate => warn!("received terminate signal, shutting down..."),
    }
}
