use metrics::{counter, gauge, histogram};
use std::time::Instant;

// ── Metric names ────────────────────────────────────────────────────────

/// Total HTTP requests by endpoint and status
pub const REQUESTS_TOTAL: &str = "midroll_requests_total";
/// Request duration in seconds
pub const REQUEST_DURATION: &str = "midroll_request_duration_seconds";
/// Manifest rewrites by mode (csi, ssai) and outcome (ok, fallback, passthrough)
pub const REWRITES_TOTAL: &str = "midroll_rewrites_total";
/// Decision requests by result (success, timeout, error, empty, cached)
pub const DECISION_REQUESTS: &str = "midroll_decision_requests_total";
/// Slate fallback activations
pub const SLATE_FALLBACKS: &str = "midroll_slate_fallbacks_total";
/// Origin fetch errors
pub const ORIGIN_FETCH_ERRORS: &str = "midroll_origin_fetch_errors_total";
/// Skip-plan failures by reason
pub const SKIP_PLAN_FAILURES: &str = "midroll_skip_plan_failures_total";
/// SCTE-35 sections with CRC mismatch
pub const SCTE35_CRC_FAILURES: &str = "midroll_scte35_crc_failures_total";
/// Beacon deliveries by event and outcome
pub const BEACONS_TOTAL: &str = "midroll_beacons_total";
/// Active pinned ad breaks
pub const ACTIVE_BREAKS: &str = "midroll_active_breaks";
/// Last observed PTS↔PDT drift in milliseconds
pub const PDT_DRIFT_MS: &str = "midroll_pdt_drift_ms";

// ── Recording helpers ───────────────────────────────────────────────────

/// Record an incoming request
pub fn record_request(endpoint: &str, status: u16) {
    counter!(REQUESTS_TOTAL, "endpoint" => endpoint.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record request duration
pub fn record_duration(endpoint: &str, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    histogram!(REQUEST_DURATION, "endpoint" => endpoint.to_string()).record(duration);
}

/// Record a manifest rewrite outcome
pub fn record_rewrite(mode: &str, outcome: &str) {
    counter!(REWRITES_TOTAL, "mode" => mode.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a decision request result
pub fn record_decision(result: &str) {
    counter!(DECISION_REQUESTS, "result" => result.to_string()).increment(1);
}

/// Record a slate fallback activation
pub fn record_slate_fallback() {
    counter!(SLATE_FALLBACKS).increment(1);
}

/// Record an origin fetch error
pub fn record_origin_error() {
    counter!(ORIGIN_FETCH_ERRORS).increment(1);
}

/// Record a skip-plan failure
pub fn record_skip_plan_failure(reason: &str) {
    counter!(SKIP_PLAN_FAILURES, "reason" => reason.to_string()).increment(1);
}

/// Record a SCTE-35 CRC mismatch
pub fn record_scte35_crc_failure() {
    counter!(SCTE35_CRC_FAILURES).increment(1);
}

/// Record a beacon delivery attempt
pub fn record_beacon(event: &str, outcome: &str) {
    counter!(BEACONS_TOTAL, "event" => event.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Update the active pinned-break gauge
pub fn set_active_breaks(count: usize) {
    gauge!(ACTIVE_BREAKS).set(count as f64);
}

/// Record the last observed PTS↔PDT drift
pub fn set_pdt_drift_ms(drift_ms: f64) {
    gauge!(PDT_DRIFT_MS).set(drift_ms);
}
