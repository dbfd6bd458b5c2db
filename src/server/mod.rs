pub mod handlers;
pub mod state;

use crate::config::Config;
use axum::{
    Router,
    routing::{get, post},
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use state::AppState;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Build the full application router. Exposed separately from [`start`] so
/// integration tests can drive it on an ephemeral port.
pub async fn build_router(config: Config) -> Router {
    let prometheus_handle = prometheus_handle();
    let state = AppState::new(config).await;

    // Periodic cleanup: stale quartile cursors would otherwise accumulate
    let quartiles = state.rewriter.quartiles.clone();
    let breaks = state.rewriter.store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let purged = quartiles.purge_stale(std::time::Duration::from_secs(600));
            if purged > 0 {
                info!("Cleanup: purged {} stale quartile cursor(s)", purged);
            }
            crate::metrics::set_active_breaks(breaks.active_count().await);
        }
    });

    // CORS: always permissive — playlists must be fetchable from any web
    // player origin (HLS.js, video.js, AVPlayer in a WKWebView, …)
    let cors = CorsLayer::very_permissive();

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route(
            "/metrics",
            get({
                let handle = prometheus_handle.clone();
                move || handlers::metrics::serve_metrics(handle)
            }),
        )
        // Demo endpoints: synthetic origin + config + decision for local loops
        .route("/demo/{variant}", get(handlers::demo::serve_demo_playlist))
        .route(
            "/demo/config/channels/{org}/{channel}",
            get(handlers::demo::serve_demo_config),
        )
        .route(
            "/demo/config/channels/by-id/{id}",
            get(handlers::demo::serve_demo_config_by_id),
        )
        .route("/demo/decision", post(handlers::demo::serve_demo_decision))
        // Segmenter contract: IDR frames + PTS/PDT samples in
        .route(
            "/timeline/{channel}",
            post(handlers::timeline::ingest_timeline),
        )
        // The core: master and variant playlist rewriting
        .route(
            "/{org}/{channel}/master.m3u8",
            get(handlers::playlist::serve_master),
        )
        .route(
            "/{org}/{channel}/{variant}",
            get(handlers::playlist::serve_variant),
        )
        .layer(cors)
        .with_state(state)
}

/// Install the Prometheus recorder, or fall back to a detached handle when a
/// recorder is already registered (multiple routers in one test process).
fn prometheus_handle() -> PrometheusHandle {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics recorder installed");
            handle
        }
        Err(_) => PrometheusBuilder::new().build_recorder().handle(),
    }
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.port;
    let base_url = config.base_url.clone();

    let app = build_router(config).await;

    let addr = format!("0.0.0.0:{}", port);
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Failed to bind to {}: {}. Is port {} already in use?",
                addr, e, port
            );
            return Err(e.into());
        }
    };

    info!("Server bound to {}", addr);
    info!("Public URL: {}", base_url);
    info!("  Health:   {}/health", base_url);
    info!("  Metrics:  {}/metrics", base_url);
    info!("  Playlist: {}/{{org}}/{{channel}}/{{variant}}.m3u8", base_url);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
