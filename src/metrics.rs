//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedispatch_federation_requests_total", "Total number of outbound federation requests"),
        &["kind", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedispatch_federation_request_duration_seconds",
            "Outbound federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["kind"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_FEDERATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedispatch_activities_federated_total", "Total number of activities handed to the dispatcher"),
        &["verb"]
    ).expect("metric can be created");
    pub static ref LOCAL_INBOX_DELIVERIES_TOTAL: IntCounter = IntCounter::new(
        "fedispatch_local_inbox_deliveries_total",
        "Total number of activities appended to local inboxes"
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedispatch_jobs_total", "Total number of job attempts by outcome"),
        &["job", "outcome"]
    ).expect("metric can be created");
    pub static ref JOBS_PENDING: IntGauge = IntGauge::new(
        "fedispatch_jobs_pending",
        "Jobs submitted but not yet completed or dead-lettered"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedispatch_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedispatch_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedispatch_errors_total", "Total number of errors"),
        &["error_type", "source"]
    ).expect("metric can be created");
}

/// Record the outcome and latency of one outbound request.
pub fn observe_federation_request(kind: &str, status: &str, elapsed: std::time::Duration) {
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&[kind, status])
        .inc();
    FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
        .expect("FEDERATION_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()))
        .expect("FEDERATION_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_FEDERATED_TOTAL.clone()))
        .expect("ACTIVITIES_FEDERATED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(LOCAL_INBOX_DELIVERIES_TOTAL.clone()))
        .expect("LOCAL_INBOX_DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(JOBS_TOTAL.clone()))
        .expect("JOBS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(JOBS_PENDING.clone()))
        .expect("JOBS_PENDING can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
