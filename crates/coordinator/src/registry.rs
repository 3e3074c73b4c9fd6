//! Node and session status registry
//!
//! One process-wide registry is built at startup from the static topology and
//! handed to every component that needs it. The metrics sampler and the
//! health monitor write node state; the coordinator and the status endpoints
//! read it.

use edgeloop_common::config::{host_of, CoordinatorConfig, EngineConfig, NodeConfig};
use edgeloop_common::METRICS;
use edgeloop_proto::{
    ActiveSessionView, HealthState, MetricStat, NodeRole, NodeStats, NodeStatusView, SessionState,
    SystemStatusView,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Last-known state of one node
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u32,
    pub role: NodeRole,
    pub address: String,

    /// Container name, defaulting to the host part of the address
    pub container: String,
    pub health: HealthState,
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
    pub last_healthy_at: Option<SystemTime>,

    /// The last metrics sample failed; the values above are old
    pub stale: bool,
}

impl Node {
    fn from_config(config: &NodeConfig) -> Self {
        Self {
            id: config.id,
            role: config.role,
            address: config.address.clone(),
            container: config
                .container
                .clone()
                .unwrap_or_else(|| config.host().to_string()),
            health: HealthState::Unknown,
            cpu_percent: None,
            memory_mb: None,
            last_healthy_at: None,
            stale: false,
        }
    }

    pub fn is_available(&self) -> bool {
        self.health.is_available()
    }

    pub fn host(&self) -> &str {
        host_of(&self.address)
    }

    fn view(&self) -> NodeStatusView {
        NodeStatusView {
            id: self.id,
            role: self.role,
            address: self.address.clone(),
            health_state: self.health,
            is_available: self.is_available(),
            cpu_percent: self.cpu_percent,
            memory_mb: self.memory_mb,
            stale: self.stale,
            last_healthy_at: self
                .last_healthy_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64()),
        }
    }
}

/// One resource reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug)]
struct NodeRecord {
    node: Node,
    window: VecDeque<NodeSample>,
    sample_failures: u32,
    health_failures: u32,

    /// Escalated by the sampler; health checks cannot clear it
    sampling_lost: bool,
}

impl NodeRecord {
    /// Health to store for a report of `health`. A node the sampler gave up
    /// on stays unreachable until a sample succeeds again.
    fn reported(&self, health: HealthState) -> HealthState {
        if self.sampling_lost && health == HealthState::Healthy {
            HealthState::Unreachable
        } else {
            health
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    nodes: BTreeMap<u32, NodeRecord>,
    session: Option<ActiveSessionView>,
    window_capacity: usize,
}

impl RegistryInner {
    fn refresh_available_gauge(&self) {
        let available = self.nodes.values().filter(|r| r.node.is_available()).count();
        METRICS.node.available.set(available as f64);
    }
}

/// Shared handle to node and session status
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    model_identifier: Arc<str>,
    tokenizer_identifier: Arc<str>,
}

impl NodeRegistry {
    /// Create a registry for a static topology
    pub fn new(
        nodes: &[NodeConfig],
        window_capacity: usize,
        model_identifier: impl Into<String>,
        tokenizer_identifier: impl Into<String>,
    ) -> Self {
        let nodes = nodes
            .iter()
            .map(|config| {
                let record = NodeRecord {
                    node: Node::from_config(config),
                    window: VecDeque::with_capacity(window_capacity.min(4096)),
                    sample_failures: 0,
                    health_failures: 0,
                    sampling_lost: false,
                };
                (config.id, record)
            })
            .collect();

        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                nodes,
                session: None,
                window_capacity: window_capacity.max(1),
            })),
            model_identifier: Arc::from(model_identifier.into()),
            tokenizer_identifier: Arc::from(tokenizer_identifier.into()),
        }
    }

    /// Create a registry from the loaded configuration
    pub fn from_config(coordinator: &CoordinatorConfig, engine: &EngineConfig) -> Self {
        Self::new(
            &coordinator.nodes,
            coordinator.sampler.window_size,
            engine.model_identifier(),
            engine.tokenizer_identifier(),
        )
    }

    pub fn node(&self, id: u32) -> Option<Node> {
        self.inner.read().nodes.get(&id).map(|r| r.node.clone())
    }

    /// All nodes ordered by id
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.read().nodes.values().map(|r| r.node.clone()).collect()
    }

    pub fn workers(&self) -> Vec<Node> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|r| r.node.role == NodeRole::Worker)
            .map(|r| r.node.clone())
            .collect()
    }

    pub fn root_id(&self) -> Option<u32> {
        self.inner
            .read()
            .nodes
            .values()
            .find(|r| r.node.role == NodeRole::Root)
            .map(|r| r.node.id)
    }

    /// Ids of healthy workers, i.e. the links a decode step crosses
    pub fn available_workers(&self) -> Vec<u32> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|r| r.node.role == NodeRole::Worker && r.node.is_available())
            .map(|r| r.node.id)
            .collect()
    }

    pub fn available_count(&self) -> usize {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|r| r.node.is_available())
            .count()
    }

    /// Store a successful metrics sample
    pub fn record_sample(&self, id: u32, sample: NodeSample) {
        let mut inner = self.inner.write();
        let capacity = inner.window_capacity;
        let Some(record) = inner.nodes.get_mut(&id) else {
            return;
        };

        record.node.cpu_percent = Some(sample.cpu_percent);
        record.node.memory_mb = Some(sample.memory_mb);
        record.node.stale = false;
        record.sample_failures = 0;
        record.sampling_lost = false;

        if record.window.len() == capacity {
            record.window.pop_front();
        }
        record.window.push_back(sample);

        let label = id.to_string();
        METRICS
            .node
            .cpu_percent
            .with_label_values(&[&label])
            .set(sample.cpu_percent as f64);
        METRICS
            .node
            .memory_mb
            .with_label_values(&[&label])
            .set(sample.memory_mb);
    }

    /// Record a failed sample. Last-known values are kept and flagged stale.
    ///
    /// Returns `true` when this failure pushed the node to `unreachable`.
    pub fn record_sample_failure(&self, id: u32, threshold: u32) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.nodes.get_mut(&id) else {
            return false;
        };

        record.node.stale = true;
        record.sample_failures = record.sample_failures.saturating_add(1);
        METRICS
            .node
            .sample_failures_total
            .with_label_values(&[&id.to_string()])
            .inc();

        if record.sample_failures >= threshold {
            record.sampling_lost = true;
        }
        let escalate = record.sampling_lost && record.node.health != HealthState::Unreachable;
        if escalate {
            warn!(
                "Node {} marked as unreachable after {} failed samples",
                id, record.sample_failures
            );
            record.node.health = HealthState::Unreachable;
            inner.refresh_available_gauge();
        }
        escalate
    }

    /// Overwrite a node's health state
    pub fn set_health(&self, id: u32, health: HealthState) {
        let mut inner = self.inner.write();
        let Some(record) = inner.nodes.get_mut(&id) else {
            return;
        };
        let health = record.reported(health);
        if record.node.health != health {
            debug!("Node {} health {} -> {}", id, record.node.health, health);
            record.node.health = health;
        }
        if health == HealthState::Healthy {
            record.node.last_healthy_at = Some(SystemTime::now());
        }
        inner.refresh_available_gauge();
    }

    /// A health check succeeded
    pub fn record_health_success(&self, id: u32) {
        let mut inner = self.inner.write();
        let Some(record) = inner.nodes.get_mut(&id) else {
            return;
        };
        record.health_failures = 0;
        let health = record.reported(HealthState::Healthy);
        if health != HealthState::Healthy {
            debug!("Node {} answers but its metrics are still unavailable", id);
            record.node.health = health;
            inner.refresh_available_gauge();
            return;
        }
        if record.node.health != HealthState::Healthy {
            info!("Node {} is healthy", id);
        }
        record.node.health = HealthState::Healthy;
        record.node.last_healthy_at = Some(SystemTime::now());
        inner.refresh_available_gauge();
    }

    /// A health check failed.
    ///
    /// Returns `true` when this failure pushed the node to `unreachable`.
    pub fn record_health_failure(&self, id: u32, threshold: u32) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.nodes.get_mut(&id) else {
            return false;
        };

        record.health_failures = record.health_failures.saturating_add(1);
        METRICS
            .node
            .health_failures_total
            .with_label_values(&[&id.to_string()])
            .inc();

        let escalate = record.health_failures >= threshold
            && record.node.health != HealthState::Unreachable;
        if escalate {
            warn!(
                "Node {} marked as unreachable after {} failed health checks",
                id, record.health_failures
            );
            record.node.health = HealthState::Unreachable;
            inner.refresh_available_gauge();
        }
        escalate
    }

    /// Start a fresh metrics window on every node
    pub fn reset_windows(&self) {
        let mut inner = self.inner.write();
        for record in inner.nodes.values_mut() {
            record.window.clear();
        }
    }

    /// `{max, avg}` of CPU and memory over the current window, per node
    pub fn window_stats(&self) -> (NodeStats, NodeStats) {
        let inner = self.inner.read();
        let mut cpu = NodeStats::new();
        let mut mem = NodeStats::new();

        for (id, record) in &inner.nodes {
            if let Some(stat) = summarize(record.window.iter().map(|s| s.cpu_percent as f64)) {
                cpu.insert(*id, stat);
            }
            if let Some(stat) = summarize(record.window.iter().map(|s| s.memory_mb)) {
                mem.insert(*id, stat);
            }
        }
        (cpu, mem)
    }

    /// Publish the state of the current session
    pub fn set_session(&self, request_id: &str, state: SessionState) {
        self.inner.write().session = Some(ActiveSessionView {
            request_id: request_id.to_string(),
            state,
        });
    }

    /// Current (or most recent) session
    pub fn session(&self) -> Option<ActiveSessionView> {
        self.inner.read().session.clone()
    }

    pub fn node_views(&self) -> Vec<NodeStatusView> {
        self.inner.read().nodes.values().map(|r| r.node.view()).collect()
    }

    pub fn system_view(&self, engine_state: &str) -> SystemStatusView {
        let inner = self.inner.read();
        let total_nodes = inner.nodes.len();
        let available_nodes = inner.nodes.values().filter(|r| r.node.is_available()).count();
        let root_available = inner
            .nodes
            .values()
            .any(|r| r.node.role == NodeRole::Root && r.node.is_available());

        let overall_status = if !root_available {
            "down"
        } else if available_nodes == total_nodes {
            "ok"
        } else {
            "degraded"
        };

        SystemStatusView {
            overall_status: overall_status.to_string(),
            total_nodes,
            available_nodes,
            model_identifier: self.model_identifier.to_string(),
            tokenizer_identifier: self.tokenizer_identifier.to_string(),
            engine_state: engine_state.to_string(),
            session: inner.session.clone(),
        }
    }
}

fn summarize(values: impl Iterator<Item = f64>) -> Option<MetricStat> {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut max = f64::MIN;
    for value in values {
        count += 1;
        sum += value;
        max = max.max(value);
    }
    (count > 0).then(|| MetricStat {
        max,
        avg: sum / count as f64,
    })
}
