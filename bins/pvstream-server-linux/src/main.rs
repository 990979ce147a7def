use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pvstream_core::{now_epoch, Dispatcher, Settings};
use pvstream_server::{FanoutManager, PvStreamServer, ServerConfig};
use pvstream_sources::{start_source, ValueSource};
use pvstream_web::{create_router, AppState, ServerState};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pvstream_server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("pvstream server starting...");

    // Configuration
    let settings = Settings::from_env()?;
    tracing::debug!(?settings, "Loaded settings");

    // Core state and value source
    let dispatcher = Arc::new(Dispatcher::new(settings.max_raw_points));
    let source = start_source(&settings, dispatcher.clone()).await;
    tracing::info!(mode = ?source.mode(), "Value source running");

    let fanout = Arc::new(FanoutManager::new(dispatcher.clone()));
    let state: AppState = Arc::new(ServerState::new(
        dispatcher.clone(),
        source.clone(),
        fanout.clone(),
    ));

    // Spawn WebSocket server
    let server = PvStreamServer::new(ServerConfig::from(&settings), fanout, source.clone());
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!("WebSocket server error: {}", e);
        }
    });

    // Start HTTP API server
    let http_addr = settings.http_addr;
    let http_state = state.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(http_addr, http_state).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    // Statistics rate window
    let stats_state = state.clone();
    let stats_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            stats_state
                .stats
                .update_rate(stats_state.dispatcher.notified_count());
        }
    });

    if let Some(max_idle) = settings.prune_idle() {
        tokio::spawn(prune_idle(dispatcher.clone(), max_idle));
    }

    tracing::info!("pvstream server ready");
    tracing::info!("   WebSocket: ws://{}/ws", settings.ws_addr);
    tracing::info!("   HTTP API:  http://{}/api/pvs", settings.http_addr);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = ws_handle => {
            tracing::warn!("WebSocket server stopped");
        }
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = stats_handle => {
            tracing::warn!("Statistics task stopped");
        }
    }

    source.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Start the HTTP API server
async fn start_http_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically forget last values nobody watches.
async fn prune_idle(dispatcher: Arc<Dispatcher>, max_idle: Duration) {
    let mut interval = tokio::time::interval(max_idle.clamp(Duration::from_secs(1), Duration::from_secs(60)));
    loop {
        interval.tick().await;
        let pruned = dispatcher.prune_idle(now_epoch(), max_idle.as_secs_f64());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned idle variables");
        }
    }
}
