//! Metrics collection for EdgeLoop
//!
//! This module provides Prometheus metrics for observability.
//! Updates are plain atomic operations so they can sit on the per-token path.

use lazy_static::lazy_static;
use prometheus::{Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for EdgeLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub session: SessionMetrics,
    pub engine: EngineMetrics,
    pub node: NodeMetrics,
}

/// Generation session metrics
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Total number of generation requests accepted
    pub requests_total: IntCounter,

    /// Sessions that reached `completed`
    pub completed_total: IntCounter,

    /// Sessions that reached `errored`
    pub errored_total: IntCounter,

    /// Requests rejected because a session was in flight
    pub busy_rejections_total: IntCounter,

    /// Sessions currently in flight (0 or 1)
    pub active: IntGauge,

    /// Tokens emitted to clients
    pub tokens_total: IntCounter,

    /// Time to first token
    pub ttft: Histogram,

    /// Wall-clock generation time
    pub generation_duration: Histogram,

    /// Simulated delay injected per token
    pub token_delay: Histogram,
}

/// Inference engine lifecycle metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub starts_total: IntCounter,
    pub crashes_total: IntCounter,
    pub restarts_total: IntCounter,
    pub aborts_total: IntCounter,

    /// 1 when the engine reports ready
    pub ready: IntGauge,
}

/// Per-node metrics, labelled by node id
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    pub cpu_percent: GaugeVec,
    pub memory_mb: GaugeVec,
    pub sample_failures_total: IntCounterVec,
    pub health_failures_total: IntCounterVec,

    /// Nodes currently healthy
    pub available: Gauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets)).unwrap()
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Session metrics
        let requests_total = IntCounter::new(
            "edgeloop_session_requests_total",
            "Total number of accepted generation requests",
        )
        .unwrap();

        let completed_total = IntCounter::new(
            "edgeloop_session_completed_total",
            "Sessions that completed",
        )
        .unwrap();

        let errored_total = IntCounter::new(
            "edgeloop_session_errored_total",
            "Sessions that ended with an error",
        )
        .unwrap();

        let busy_rejections_total = IntCounter::new(
            "edgeloop_session_busy_rejections_total",
            "Requests rejected while another session was in flight",
        )
        .unwrap();

        let active = IntGauge::new(
            "edgeloop_session_active",
            "Generation sessions currently in flight",
        )
        .unwrap();

        let tokens_total = IntCounter::new(
            "edgeloop_session_tokens_total",
            "Tokens streamed to clients",
        )
        .unwrap();

        let ttft = histogram(
            "edgeloop_session_ttft_seconds",
            "Time from request acceptance to first token",
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        );

        let generation_duration = histogram(
            "edgeloop_session_generation_seconds",
            "Wall-clock duration of completed sessions",
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
        );

        let token_delay = histogram(
            "edgeloop_session_token_delay_seconds",
            "Simulated network delay injected per token",
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5],
        );

        // Engine metrics
        let starts_total = IntCounter::new(
            "edgeloop_engine_starts_total",
            "Inference engine process starts",
        )
        .unwrap();

        let crashes_total = IntCounter::new(
            "edgeloop_engine_crashes_total",
            "Inference engine crashes or stalls detected",
        )
        .unwrap();

        let restarts_total = IntCounter::new(
            "edgeloop_engine_restarts_total",
            "Forced inference engine restarts",
        )
        .unwrap();

        let aborts_total = IntCounter::new(
            "edgeloop_engine_aborts_total",
            "Aborted submissions",
        )
        .unwrap();

        let ready = IntGauge::new("edgeloop_engine_ready", "1 when the engine is ready").unwrap();

        // Node metrics
        let cpu_percent = GaugeVec::new(
            Opts::new("edgeloop_node_cpu_percent", "Last sampled CPU percent per node"),
            &["node"],
        )
        .unwrap();

        let memory_mb = GaugeVec::new(
            Opts::new("edgeloop_node_memory_mb", "Last sampled memory in MB per node"),
            &["node"],
        )
        .unwrap();

        let sample_failures_total = IntCounterVec::new(
            Opts::new(
                "edgeloop_node_sample_failures_total",
                "Failed metrics samples per node",
            ),
            &["node"],
        )
        .unwrap();

        let health_failures_total = IntCounterVec::new(
            Opts::new(
                "edgeloop_node_health_failures_total",
                "Failed health checks per node",
            ),
            &["node"],
        )
        .unwrap();

        let available = Gauge::new("edgeloop_nodes_available", "Nodes currently healthy").unwrap();

        // Register all metrics
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(completed_total.clone())).unwrap();
        registry.register(Box::new(errored_total.clone())).unwrap();
        registry.register(Box::new(busy_rejections_total.clone())).unwrap();
        registry.register(Box::new(active.clone())).unwrap();
        registry.register(Box::new(tokens_total.clone())).unwrap();
        registry.register(Box::new(ttft.clone())).unwrap();
        registry.register(Box::new(generation_duration.clone())).unwrap();
        registry.register(Box::new(token_delay.clone())).unwrap();

        registry.register(Box::new(starts_total.clone())).unwrap();
        registry.register(Box::new(crashes_total.clone())).unwrap();
        registry.register(Box::new(restarts_total.clone())).unwrap();
        registry.register(Box::new(aborts_total.clone())).unwrap();
        registry.register(Box::new(ready.clone())).unwrap();

        registry.register(Box::new(cpu_percent.clone())).unwrap();
        registry.register(Box::new(memory_mb.clone())).unwrap();
        registry.register(Box::new(sample_failures_total.clone())).unwrap();
        registry.register(Box::new(health_failures_total.clone())).unwrap();
        registry.register(Box::new(available.clone())).unwrap();

        let session = SessionMetrics {
            requests_total,
            completed_total,
            errored_total,
            busy_rejections_total,
            active,
            tokens_total,
            ttft,
            generation_duration,
            token_delay,
        };

        let engine = EngineMetrics {
            starts_total,
            crashes_total,
            restarts_total,
            aborts_total,
            ready,
        };

        let node = NodeMetrics {
            cpu_percent,
            memory_mb,
            sample_failures_total,
            health_failures_total,
            available,
        };

        MetricsRegistry {
            registry,
            session,
            engine,
            node,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
