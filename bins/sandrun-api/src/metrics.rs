// Prometheus metrics for the Sandrun API

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Once;
use tracing::error;

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Jobs accepted onto the queue (counter with language label)
    pub static ref JOBS_SUBMITTED: CounterVec = CounterVec::new(
        Opts::new("sandrun_jobs_submitted_total", "Total number of jobs queued"),
        &["language"]
    )
    .expect("metric can be created");

    // Submissions refused by the guard
    pub static ref JOBS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("sandrun_jobs_rejected_total", "Total submissions rejected by validation"),
        &["reason"]
    )
    .expect("metric can be created");

    // Synchronous runs by outcome (success or error kind)
    pub static ref SYNC_RUNS: CounterVec = CounterVec::new(
        Opts::new("sandrun_sync_runs_total", "Total synchronous executions"),
        &["language", "outcome"]
    )
    .expect("metric can be created");

    // Synchronous run time histogram (in milliseconds)
    pub static ref SYNC_RUN_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "sandrun_sync_run_time_ms",
            "Synchronous execution time in milliseconds"
        )
        .buckets(vec![100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0]),
        &["language"]
    )
    .expect("metric can be created");

    // Pending descriptors, sampled on scrape
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "sandrun_queue_depth",
        "Current number of queued job descriptors"
    )
    .expect("metric can be created");

    // API request counter
    pub static ref API_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("sandrun_api_requests_total", "Total API requests"),
        &["endpoint", "method", "status"]
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Register every collector with the registry; later calls are no-ops
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(JOBS_SUBMITTED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(JOBS_REJECTED.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(SYNC_RUNS.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(SYNC_RUN_TIME.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("collector can be registered");

        REGISTRY
            .register(Box::new(API_REQUESTS.clone()))
            .expect("collector can be registered");
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record job submission
pub fn record_job_submitted(language: &str) {
    JOBS_SUBMITTED.with_label_values(&[language]).inc();
}

/// Record job rejection
pub fn record_job_rejected(reason: &str) {
    JOBS_REJECTED.with_label_values(&[reason]).inc();
}

/// Record one synchronous run
pub fn record_sync_run(language: &str, outcome: &str, duration_ms: f64) {
    SYNC_RUNS.with_label_values(&[language, outcome]).inc();
    SYNC_RUN_TIME.with_label_values(&[language]).observe(duration_ms);
}

pub fn set_queue_depth(depth: u64) {
    QUEUE_DEPTH.set(depth.min(i64::MAX as u64) as i64);
}

pub fn record_api_request(endpoint: &str, method: &str, status: u16) {
    API_REQUESTS
        .with_label_values(&[endpoint, method, &status.to_string()])
        .inc();
}
