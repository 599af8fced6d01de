//! Prometheus metrics for the subject-line service
//!
//! Exposes:
//! - HTTP request rates and latencies
//! - Selections by phase, selection failures and latency
//! - Tracked events by type and outcome
//! - Generation outcomes (cache hit, stored, generated, failed)
//! - Error counts
//!
//! NOTE: test and variant ids never appear in labels. They are unbounded and
//! would blow up series cardinality.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Request Metrics
    // ============================================================================

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "subject_http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["method", "endpoint", "status"]
    ).unwrap();

    /// Total HTTP requests
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("subject_http_requests_total", "Total HTTP requests"),
        &["method", "endpoint", "status"]
    ).unwrap();

    // ============================================================================
    // Bandit Metrics
    // ============================================================================

    /// Committed selections by phase
    pub static ref SELECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("subject_selections_total", "Committed variant selections"),
        &["method"]  // method: "round_robin", "thompson_sampling"
    ).unwrap();

    /// Selections that returned no variant
    pub static ref SELECTION_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("subject_selection_failures_total", "Failed variant selections"),
        &["reason"]
    ).unwrap();

    /// Selection latency including the store commit
    pub static ref SELECTION_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "subject_selection_duration_seconds",
            "Variant selection duration"
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5])
    ).unwrap();

    /// Tracked events
    pub static ref EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("subject_events_total", "Tracked outcome events"),
        &["event_type", "result"]  // result: "recorded" or a failure reason
    ).unwrap();

    // ============================================================================
    // Generation Metrics
    // ============================================================================

    /// Provisioning outcomes
    pub static ref GENERATION_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("subject_generation_total", "Test provisioning requests"),
        &["outcome"]  // outcome: "cache_hit", "stored", "generated", "failed"
    ).unwrap();

    /// Time spent in the subject line generator
    pub static ref GENERATION_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "subject_generation_duration_seconds",
            "Subject line generator call duration"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).unwrap();

    /// Tests currently in the active state, refreshed on dashboard reads
    pub static ref ACTIVE_TESTS: IntGauge = IntGauge::new(
        "subject_active_tests",
        "Number of active tests"
    ).unwrap();

    // ============================================================================
    // Error Metrics
    // ============================================================================

    /// Total errors by type
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("subject_errors_total", "Total errors by type"),
        &["error_type"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    // Request metrics
    METRICS_REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;

    // Bandit metrics
    METRICS_REGISTRY.register(Box::new(SELECTIONS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(SELECTION_FAILURES_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(SELECTION_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(EVENTS_TOTAL.clone()))?;

    // Generation metrics
    METRICS_REGISTRY.register(Box::new(GENERATION_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(GENERATION_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(ACTIVE_TESTS.clone()))?;

    // Error metrics
    METRICS_REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;

    Ok(())
}

/// Helper to time operations with histogram (RAII pattern)
/// Usage: let _timer = Timer::new(SOME_HISTOGRAM.clone());
pub struct Timer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Timer {
    /// Create timer that records duration to histogram on drop
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
