use crate::server::state::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_breaks: usize,
    pub cached_channels: usize,
    pub uptime_seconds: u64,
}

/// Health check endpoint returning structured JSON diagnostics
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    Json(HealthResponse {
        status: "ok",
        version: VERSION,
        active_breaks: state.rewriter.store.active_count().await,
        cached_channels: state.channels.cached_count(),
        uptime_seconds: uptime,
    })
}
