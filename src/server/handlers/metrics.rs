use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use metrics_exporter_prometheus::PrometheusHandle;

/// Serve Prometheus metrics in text exposition format.
///
/// Everything the rewrite pipeline records (requests, rewrites, decision
/// results, skip-plan failures, drift) lands here for scraping.
pub async fn serve_metrics(handle: PrometheusHandle) -> Response {
    let metrics = handle.render();

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics,
    )
        .into_response()
}
