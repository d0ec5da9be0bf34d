//! Prometheus metrics for mockwire.
//!
//! Tracks resolution outcomes, store round-trips, cross-instance events and
//! history persistence.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Dispatch outcomes
    pub static ref RESOLUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "mockwire_resolutions_total",
        "Total number of intercepted requests by resolution outcome",
        &["outcome"]  // outcome: custom_mock|custom_passthrough|default|passthrough|disabled|error
    )
    .unwrap();

    /// Dispatch duration including store round-trips
    pub static ref DISPATCH_DURATION_MS: HistogramVec = register_histogram_vec!(
        "mockwire_dispatch_duration_ms",
        "Histogram of dispatch pipeline time in milliseconds",
        &["outcome"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]
    )
    .unwrap();

    /// Shared store operations
    pub static ref STORE_OPS_TOTAL: CounterVec = register_counter_vec!(
        "mockwire_store_ops_total",
        "Total number of shared store operations",
        &["operation", "result"]  // result: success|error
    )
    .unwrap();

    /// Cross-instance events applied
    pub static ref SYNC_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "mockwire_sync_events_total",
        "Total number of cross-instance events received",
        &["command", "result"]  // command: ON|OFF|BL-SET|MOCK-SET|MOCK-DROP|unknown
    )
    .unwrap();

    /// History and response writes
    pub static ref HISTORY_WRITES_TOTAL: CounterVec = register_counter_vec!(
        "mockwire_history_writes_total",
        "Total number of history and response records written",
        &["kind", "result"]  // kind: request|response
    )
    .unwrap();
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Helper to record a dispatch outcome
pub fn record_resolution(outcome: &str, duration_ms: f64) {
    RESOLUTIONS_TOTAL.with_label_values(&[outcome]).inc();
    DISPATCH_DURATION_MS
        .with_label_values(&[outcome])
        .observe(duration_ms);
}

/// Helper to record a store round-trip
pub fn record_store_op(operation: &str, success: bool) {
    STORE_OPS_TOTAL
        .with_label_values(&[operation, result_label(success)])
        .inc();
}

/// Helper to record a received event
pub fn record_sync_event(command: &str, success: bool) {
    SYNC_EVENTS_TOTAL
        .with_label_values(&[command, result_label(success)])
        .inc();
}

/// Helper to record a history or response write
pub fn record_history_write(kind: &str, success: bool) {
    HISTORY_WRITES_TOTAL
        .with_label_values(&[kind, result_label(success)])
        .inc();
}
