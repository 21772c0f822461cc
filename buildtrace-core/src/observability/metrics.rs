//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Build lifecycle metrics
    describe_counter!(
        "buildtrace_builds_total",
        "Total number of image builds (by backend, outcome)"
    );
    describe_histogram!(
        "buildtrace_build_duration_seconds",
        "Image build duration from submission to outcome (by backend)"
    );

    // Event delivery metrics
    describe_counter!(
        "buildtrace_events_total",
        "Total number of progress events delivered to callers (by kind)"
    );
    describe_counter!(
        "buildtrace_callback_aborts_total",
        "Total number of builds aborted by the progress callback"
    );
}

/// Record the outcome of one build.
pub fn record_build(backend: &str, outcome: &str, duration_secs: f64) {
    counter!(
        "buildtrace_builds_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("buildtrace_build_duration_seconds", "backend" => backend.to_string())
        .record(duration_secs);
}
