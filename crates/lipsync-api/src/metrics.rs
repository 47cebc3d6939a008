//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "lipsync_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "lipsync_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "lipsync_http_requests_in_flight";
    pub const RUNS_SUBMITTED_TOTAL: &str = "lipsync_runs_submitted_total";
    pub const RUNS_ACTIVE: &str = "lipsync_runs_active";
    pub const UPLOAD_BYTES_TOTAL: &str = "lipsync_upload_bytes_total";
    pub const RUNS_EXPIRED_TOTAL: &str = "lipsync_runs_expired_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a run accepted by the API.
pub fn record_run_submitted(variant: &str) {
    counter!(names::RUNS_SUBMITTED_TOTAL, "variant" => variant.to_string()).increment(1);
    gauge!(names::RUNS_ACTIVE).increment(1.0);
}

/// Record a run leaving the active set.
pub fn record_run_finished() {
    gauge!(names::RUNS_ACTIVE).decrement(1.0);
}

pub fn record_upload_bytes(field: &str, bytes: u64) {
    counter!(names::UPLOAD_BYTES_TOTAL, "field" => field.to_string()).increment(bytes);
}

/// Record runs removed by the retention sweeper.
pub fn record_runs_expired(count: u64) {
    counter!(names::RUNS_EXPIRED_TOTAL).increment(count);
}

/// Replace run ids in a path with a placeholder.
fn sanitize_path(path: &str) -> String {
    let mut out = Vec::new();
    let mut after_runs = false;
    for segment in path.split('/') {
        if after_runs && !segment.is_empty() {
            out.push(":run_id");
        } else {
            out.push(segment);
        }
        after_runs = segment == "runs";
    }
    out.join("/")
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
