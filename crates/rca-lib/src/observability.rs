//! Observability infrastructure for the RCA engine
//!
//! Provides:
//! - Prometheus metrics (tick and evaluation latency, verdict counters,
//!   buffer evictions, peer traffic)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RcaMetricsInner> = OnceLock::new();

struct RcaMetricsInner {
    tick_latency_seconds: Histogram,
    evaluation_latency_seconds: Histogram,
    ticks: IntCounter,
    evaluations: IntCounter,
    empty_emissions: IntCounter,
    evaluation_failures: IntCounter,
    unhealthy_verdicts: IntCounter,
    buffer_evictions: IntCounterVec,
    units_sent: IntCounter,
    units_dropped: IntCounterVec,
    units_received: IntCounter,
    schema_mismatches: IntCounter,
    stale_peers: IntGauge,
    known_peers: IntGauge,
}

impl RcaMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "rca_tick_latency_seconds",
                "Time spent running one scheduler tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            evaluation_latency_seconds: register_histogram!(
                "rca_evaluation_latency_seconds",
                "Time spent evaluating a single vertex",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register evaluation_latency_seconds"),

            ticks: register_int_counter!("rca_ticks_total", "Total number of scheduler ticks")
                .expect("Failed to register ticks"),

            evaluations: register_int_counter!(
                "rca_evaluations_total",
                "Total number of vertex evaluations"
            )
            .expect("Failed to register evaluations"),

            empty_emissions: register_int_counter!(
                "rca_empty_emissions_total",
                "Evaluations that emitted an empty flow unit"
            )
            .expect("Failed to register empty_emissions"),

            evaluation_failures: register_int_counter!(
                "rca_evaluation_failures_total",
                "Evaluations that failed or panicked"
            )
            .expect("Failed to register evaluation_failures"),

            unhealthy_verdicts: register_int_counter!(
                "rca_unhealthy_verdicts_total",
                "Total number of unhealthy verdicts emitted"
            )
            .expect("Failed to register unhealthy_verdicts"),

            buffer_evictions: register_int_counter_vec!(
                "rca_buffer_evictions_total",
                "Flow units evicted from full buffers",
                &["buffer"]
            )
            .expect("Failed to register buffer_evictions"),

            units_sent: register_int_counter!(
                "rca_network_units_sent_total",
                "Flow units delivered to peers"
            )
            .expect("Failed to register units_sent"),

            units_dropped: register_int_counter_vec!(
                "rca_network_units_dropped_total",
                "Flow units dropped on the peer transport",
                &["reason"]
            )
            .expect("Failed to register units_dropped"),

            units_received: register_int_counter!(
                "rca_network_units_received_total",
                "Flow units received from peers"
            )
            .expect("Failed to register units_received"),

            schema_mismatches: register_int_counter!(
                "rca_schema_mismatches_total",
                "Inbound envelopes rejected for a foreign graph schema"
            )
            .expect("Failed to register schema_mismatches"),

            stale_peers: register_int_gauge!("rca_stale_peers", "Peers currently marked stale")
                .expect("Failed to register stale_peers"),

            known_peers: register_int_gauge!("rca_known_peers", "Peers in the roster")
                .expect("Failed to register known_peers"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct RcaMetrics {
    _private: (),
}

impl Default for RcaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RcaMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RcaMetrics")
    }
}

impl RcaMetrics {
    /// Create a metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RcaMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RcaMetricsInner {
        GLOBAL_METRICS.get_or_init(RcaMetricsInner::new)
    }

    pub fn observe_tick(&self, duration_secs: f64) {
        self.inner().ticks.inc();
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn observe_evaluation(&self, duration_secs: f64) {
        self.inner().evaluations.inc();
        self.inner().evaluation_latency_seconds.observe(duration_secs);
    }

    pub fn inc_empty_emissions(&self) {
        self.inner().empty_emissions.inc();
    }

    pub fn inc_evaluation_failures(&self) {
        self.inner().evaluation_failures.inc();
    }

    pub fn inc_unhealthy_verdicts(&self) {
        self.inner().unhealthy_verdicts.inc();
    }

    /// Count evictions from a vertex input buffer or a peer queue
    pub fn add_buffer_evictions(&self, buffer: &str, count: usize) {
        if count > 0 {
            self.inner()
                .buffer_evictions
                .with_label_values(&[buffer])
                .inc_by(count as u64);
        }
    }

    pub fn add_units_sent(&self, count: usize) {
        self.inner().units_sent.inc_by(count as u64);
    }

    pub fn add_units_dropped(&self, reason: &str, count: usize) {
        if count > 0 {
            self.inner()
                .units_dropped
                .with_label_values(&[reason])
                .inc_by(count as u64);
        }
    }

    pub fn add_units_received(&self, count: usize) {
        self.inner().units_received.inc_by(count as u64);
    }

    pub fn inc_schema_mismatches(&self) {
        self.inner().schema_mismatches.inc();
    }

    pub fn set_peer_counts(&self, known: usize, stale: usize) {
        self.inner().known_peers.set(known as i64);
        self.inner().stale_peers.set(stale as i64);
    }
}

/// Structured logger for engine events
///
/// Consistent JSON-formatted events for verdicts, peer state changes and the
/// agent lifecycle.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Log an unhealthy verdict
    pub fn log_unhealthy_verdict(&self, vertex: &str, resource: &str, timestamp: i64) {
        warn!(
            event = "verdict_unhealthy",
            node = %self.node_name,
            vertex = %vertex,
            resource = %resource,
            timestamp = timestamp,
            "Resource reported unhealthy"
        );
    }

    /// Log a peer going stale
    pub fn log_peer_stale(&self, peer: &str, silent_secs: i64, dropped_units: usize) {
        warn!(
            event = "peer_stale",
            node = %self.node_name,
            peer = %peer,
            silent_secs = silent_secs,
            dropped_units = dropped_units,
            "Peer marked stale, pending units discarded"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, graph: &str, schema_version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            graph = %graph,
            schema_version = %schema_version,
            "RCA agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "RCA agent shutting down"
        );
    }
}
