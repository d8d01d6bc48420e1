//! Prometheus metrics for the RPC core.
//!
//! All metrics follow the naming convention: `mq_<component>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // RPC CLIENT METRICS
    // =========================================================================

    /// Requests published by the correlation engine
    pub static ref RPC_CALLS_SENT: Counter = Counter::new(
        "mq_rpc_calls_sent_total",
        "Total number of RPC requests published"
    ).expect("metric creation failed");

    /// Replies matched to a pending call
    pub static ref RPC_REPLIES_MATCHED: Counter = Counter::new(
        "mq_rpc_replies_matched_total",
        "Total number of replies matched to a pending call"
    ).expect("metric creation failed");

    /// Replies with no pending call (late, duplicate or foreign)
    pub static ref RPC_REPLIES_UNMATCHED: Counter = Counter::new(
        "mq_rpc_replies_unmatched_total",
        "Total number of replies dropped because no call was pending"
    ).expect("metric creation failed");

    /// Failed calls by reason
    pub static ref RPC_CALL_FAILURES: CounterVec = CounterVec::new(
        Opts::new("mq_rpc_call_failures_total", "Failed RPC calls by reason"),
        &["reason"]  // reason: publish/transport/deserialize/timeout/shutdown/not_connected
    ).expect("metric creation failed");

    /// Calls currently waiting for a reply
    pub static ref RPC_PENDING_CALLS: Gauge = Gauge::new(
        "mq_rpc_pending_calls",
        "Number of RPC calls waiting for a reply"
    ).expect("metric creation failed");

    /// Round-trip time of completed calls
    pub static ref RPC_CALL_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "mq_rpc_call_duration_seconds",
            "Time from publish to matched reply"
        ).buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // RPC WORKER METRICS
    // =========================================================================

    /// Requests handled by responders, by outcome
    pub static ref RPC_REQUESTS_SERVED: CounterVec = CounterVec::new(
        Opts::new("mq_rpc_requests_served_total", "Requests handled by responders"),
        &["routing_key", "outcome"]  // outcome: ok/error/dropped
    ).expect("metric creation failed");

    // =========================================================================
    // BROKER CONNECTION METRICS
    // =========================================================================

    /// Connect attempts made by the supervisor
    pub static ref BROKER_CONNECT_ATTEMPTS: Counter = Counter::new(
        "mq_broker_connect_attempts_total",
        "Total number of broker connect attempts"
    ).expect("metric creation failed");

    /// Successful (re)connections
    pub static ref BROKER_CONNECTIONS: Counter = Counter::new(
        "mq_broker_connections_total",
        "Total number of successful broker connections"
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Calling this more than once is harmless.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Client
        Box::new(RPC_CALLS_SENT.clone()),
        Box::new(RPC_REPLIES_MATCHED.clone()),
        Box::new(RPC_REPLIES_UNMATCHED.clone()),
        Box::new(RPC_CALL_FAILURES.clone()),
        Box::new(RPC_PENDING_CALLS.clone()),
        Box::new(RPC_CALL_DURATION.clone()),
        // Worker
        Box::new(RPC_REQUESTS_SERVED.clone()),
        // Broker
        Box::new(BROKER_CONNECT_ATTEMPTS.clone()),
        Box::new(BROKER_CONNECTIONS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Record a failed call under `reason`.
pub fn record_failure(reason: &str) {
    RPC_CALL_FAILURES.with_label_values(&[reason]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_twice() {
        assert!(register_metrics().is_ok());
        assert!(register_metrics().is_ok());
    }

    #[test]
    fn test_counter_increment() {
        RPC_CALLS_SENT.inc();
        assert!(RPC_CALLS_SENT.get() >= 1.0);
    }

    #[test]
    fn test_failure_labels() {
        record_failure("timeout");
        assert!(RPC_CALL_FAILURES.with_label_values(&["timeout"]).get() >= 1.0);
    }

    #[test]
    fn test_encode_contains_registered_metric() {
        register_metrics().unwrap();
        BROKER_CONNECTIONS.inc();
        let text = encode_metrics().unwrap();
        assert!(text.contains("mq_broker_connections_total"));
    }
}
