//! Pipeline metrics. Nothing is exported unless the host installs a recorder.

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const RUNS_TOTAL: &str = "lipsync_runs_total";
    pub const RUN_DURATION_SECONDS: &str = "lipsync_run_duration_seconds";
    pub const INFERENCE_DURATION_SECONDS: &str = "lipsync_inference_duration_seconds";
    pub const DOWNLOADS_TOTAL: &str = "lipsync_downloads_total";
    pub const DOWNLOAD_BYTES_TOTAL: &str = "lipsync_download_bytes_total";
    pub const DOWNLOAD_DURATION_SECONDS: &str = "lipsync_download_duration_seconds";
    pub const CLEANUP_FAILURES_TOTAL: &str = "lipsync_cleanup_failures_total";
}

/// Record a finished run.
pub fn record_run(outcome: &str, variant: &str, duration_secs: f64) {
    let labels = [
        ("outcome", outcome.to_string()),
        ("variant", variant.to_string()),
    ];
    counter!(names::RUNS_TOTAL, &labels).increment(1);
    histogram!(names::RUN_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record how long the external program ran.
pub fn record_inference_duration(variant: &str, duration_secs: f64) {
    let labels = [("variant", variant.to_string())];
    histogram!(names::INFERENCE_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a download attempt.
pub fn record_download(asset: &str, outcome: &str, bytes: u64, duration_secs: f64) {
    let labels = [
        ("asset", asset.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::DOWNLOADS_TOTAL, &labels).increment(1);
    counter!(names::DOWNLOAD_BYTES_TOTAL, "asset" => asset.to_string()).increment(bytes);
    histogram!(names::DOWNLOAD_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_cleanup_failure() {
    counter!(names::CLEANUP_FAILURES_TOTAL).increment(1);
}
