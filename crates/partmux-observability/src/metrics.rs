use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

const LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Client connections currently open
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "partmux_connections_active",
        "Number of active client connections"
    ).expect("metric can be created");

    /// Client connections closed on accept because the limit was reached
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounter = IntCounter::new(
        "partmux_connections_rejected_total",
        "Client connections refused at the connection limit"
    ).expect("metric can be created");

    /// Requests handled, by API
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("partmux_requests_total", "Total client requests handled"),
        &["api"]
    ).expect("metric can be created");

    /// Request latency, by API
    pub static ref REQUEST_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("partmux_request_latency_seconds", "Client request latency in seconds")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["api"]
    ).expect("metric can be created");

    /// Requests answered with REQUEST_TIMED_OUT, by API
    pub static ref REQUEST_TIMEOUTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("partmux_request_timeouts_total", "Client requests that exceeded the deadline"),
        &["api"]
    ).expect("metric can be created");

    /// Bytes moved between clients and the proxy, by direction (in/out)
    pub static ref BYTES_PROXIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("partmux_bytes_proxied_total", "Bytes proxied"),
        &["direction"]
    ).expect("metric can be created");

    // ============================================================================
    // Virtual Partition Metrics
    // ============================================================================

    /// Records written to physical partitions
    pub static ref RECORDS_PRODUCED_TOTAL: IntCounter = IntCounter::new(
        "partmux_records_produced_total",
        "Records produced through the proxy"
    ).expect("metric can be created");

    /// Records returned to consumers
    pub static ref RECORDS_FETCHED_TOTAL: IntCounter = IntCounter::new(
        "partmux_records_fetched_total",
        "Records returned to consumers"
    ).expect("metric can be created");

    /// Records read from a physical partition that belonged to another virtual partition
    pub static ref RECORDS_FILTERED_TOTAL: IntCounter = IntCounter::new(
        "partmux_records_filtered_total",
        "Records scanned but not returned to the requesting virtual partition"
    ).expect("metric can be created");

    /// Virtual partitions observed in physical logs
    pub static ref VIRTUAL_PARTITIONS_ACTIVE: IntGauge = IntGauge::new(
        "partmux_virtual_partitions_active",
        "Virtual partitions with at least one record seen by this proxy"
    ).expect("metric can be created");

    /// Offset lookups served from an index anchor
    pub static ref TRANSLATION_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "partmux_translation_cache_hits_total",
        "Offset translations served from the index"
    ).expect("metric can be created");

    /// Offset lookups that fell back to scanning from the partition origin
    pub static ref TRANSLATION_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "partmux_translation_cache_misses_total",
        "Offset translations that required a scan from the origin"
    ).expect("metric can be created");

    // ============================================================================
    // Backend Metrics
    // ============================================================================

    /// Failed connection attempts or broken connections, by broker address
    pub static ref BACKEND_CONNECTION_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("partmux_backend_connection_errors_total", "Backend connection errors"),
        &["broker"]
    ).expect("metric can be created");

    // ============================================================================
    // Operator Metrics
    // ============================================================================

    /// Reconcile passes, by result (ready/reconciling/failed/error)
    pub static ref RECONCILIATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("partmux_reconciliations_total", "Reconcile passes"),
        &["result"]
    ).expect("metric can be created");

    /// Reconcile pass duration
    pub static ref RECONCILE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("partmux_reconcile_duration_seconds", "Reconcile pass duration in seconds")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CONNECTIONS_ACTIVE.clone()))
            .expect("connections_active can be registered");
        REGISTRY
            .register(Box::new(CONNECTIONS_REJECTED_TOTAL.clone()))
            .expect("connections_rejected_total can be registered");
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("requests_total can be registered");
        REGISTRY
            .register(Box::new(REQUEST_LATENCY.clone()))
            .expect("request_latency can be registered");
        REGISTRY
            .register(Box::new(REQUEST_TIMEOUTS_TOTAL.clone()))
            .expect("request_timeouts_total can be registered");
        REGISTRY
            .register(Box::new(BYTES_PROXIED_TOTAL.clone()))
            .expect("bytes_proxied_total can be registered");

        REGISTRY
            .register(Box::new(RECORDS_PRODUCED_TOTAL.clone()))
            .expect("records_produced_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_FETCHED_TOTAL.clone()))
            .expect("records_fetched_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_FILTERED_TOTAL.clone()))
            .expect("records_filtered_total can be registered");
        REGISTRY
            .register(Box::new(VIRTUAL_PARTITIONS_ACTIVE.clone()))
            .expect("virtual_partitions_active can be registered");
        REGISTRY
            .register(Box::new(TRANSLATION_CACHE_HITS_TOTAL.clone()))
            .expect("translation_cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(TRANSLATION_CACHE_MISSES_TOTAL.clone()))
            .expect("translation_cache_misses_total can be registered");

        REGISTRY
            .register(Box::new(BACKEND_CONNECTION_ERRORS_TOTAL.clone()))
            .expect("backend_connection_errors_total can be registered");

        REGISTRY
            .register(Box::new(RECONCILIATIONS_TOTAL.clone()))
            .expect("reconciliations_total can be registered");
        REGISTRY
            .register(Box::new(RECONCILE_DURATION.clone()))
            .expect("reconcile_duration can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration_is_idempotent() {
        init();
        init();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"partmux_connections_active".to_string()));
    }

    #[test]
    fn test_labelled_counters() {
        REQUESTS_TOTAL.with_label_values(&["test_api"]).inc();
        BYTES_PROXIED_TOTAL.with_label_values(&["test_in"]).inc_by(1024);

        assert_eq!(REQUESTS_TOTAL.with_label_values(&["test_api"]).get(), 1);
        assert_eq!(
            BYTES_PROXIED_TOTAL.with_label_values(&["test_in"]).get(),
            1024
        );
    }

    #[test]
    fn test_backend_errors_by_broker() {
        BACKEND_CONNECTION_ERRORS_TOTAL
            .with_label_values(&["broker-test:9092"])
            .inc_by(3);
        assert_eq!(
            BACKEND_CONNECTION_ERRORS_TOTAL
                .with_label_values(&["broker-test:9092"])
                .get(),
            3
        );
    }
}
