//! Prometheus metrics for reconciliation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for HTTP requests by route and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for HTTP request duration by route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Histogram for whole-batch reconciliation duration.
pub static BATCH_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_batch_duration_seconds",
        "Batch reconciliation duration in seconds",
        &["outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to register BATCH_DURATION")
});

/// Counter for batch reconciliation runs.
pub static BATCH_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_batch_runs_total",
        "Total number of batch reconciliation runs",
        &["outcome"]
    )
    .expect("Failed to register BATCH_RUNS")
});

/// Counter for per-record outcomes.
pub static RECORD_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_record_outcomes_total",
        "Total number of record outcomes written",
        &["status", "rule"]
    )
    .expect("Failed to register RECORD_OUTCOMES")
});

/// Counter for manual reviews.
pub static REVIEWS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_reviews_total",
        "Total number of manual reviews",
        &["status"]
    )
    .expect("Failed to register REVIEWS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&BATCH_DURATION);
    Lazy::force(&BATCH_RUNS);
    Lazy::force(&RECORD_OUTCOMES);
    Lazy::force(&REVIEWS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    HTTP_REQUESTS
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method, path])
        .observe(duration_secs);
}

/// Record a finished batch run.
pub fn record_batch_run(outcome: &str, duration_secs: f64) {
    BATCH_RUNS.with_label_values(&[outcome]).inc();
    BATCH_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Record outcomes written by a rule (a linked pair counts twice).
pub fn record_outcomes(status: &str, rule: &str, count: u64) {
    RECORD_OUTCOMES
        .with_label_values(&[status, rule])
        .inc_by(count as f64);
}

/// Record a manual review.
pub fn record_review(status: &str) {
    REVIEWS.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
