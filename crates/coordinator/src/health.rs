//! Node health monitoring
//!
//! Polls every worker agent at a fixed interval and keeps the registry's
//! health states current. A worker is marked unreachable after
//! `failure_threshold` consecutive failed checks. The root node's health
//! follows the inference engine.

use crate::engine::InferenceEngine;
use crate::registry::{Node, NodeRegistry};
use crate::worker_client::WorkerControl;
use edgeloop_common::config::CoordinatorConfig;
use edgeloop_common::error::{EdgeLoopError, Result};
use edgeloop_proto::{HealthState, WorkerStatusReport};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Background health checker for all nodes
pub struct HealthMonitor {
    registry: NodeRegistry,
    workers: Arc<dyn WorkerControl>,
    engine: Arc<dyn InferenceEngine>,
    interval: Duration,
    check_timeout: Duration,
    failure_threshold: u32,
}

impl HealthMonitor {
    pub fn new(
        registry: NodeRegistry,
        workers: Arc<dyn WorkerControl>,
        engine: Arc<dyn InferenceEngine>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            workers,
            engine,
            interval: config.health_check_interval(),
            check_timeout: config.health_check_timeout(),
            failure_threshold: config.failure_threshold,
        }
    }

    /// Check every node once
    pub async fn check_once(&self) {
        if let Some(root) = self.registry.root_id() {
            self.registry.set_health(root, self.engine.state().node_health());
        }

        let workers = self.registry.workers();
        let results = join_all(workers.iter().map(|node| self.check_worker(node))).await;

        for (node, result) in workers.iter().zip(results) {
            match result {
                Ok(report) if report.is_available => {
                    self.registry.record_health_success(node.id);
                }
                Ok(report) => {
                    // Agent answers but its engine process is down
                    debug!("Worker {} is {}", node.id, report.status);
                    self.registry.set_health(node.id, HealthState::Crashed);
                }
                Err(e) => {
                    warn!("Health check failed for worker {}: {}", node.id, e);
                    self.registry
                        .record_health_failure(node.id, self.failure_threshold);
                }
            }
        }
    }

    async fn check_worker(&self, node: &Node) -> Result<WorkerStatusReport> {
        match tokio::time::timeout(self.check_timeout, self.workers.status(node)).await {
            Ok(result) => result,
            Err(_) => Err(EdgeLoopError::node_unreachable(
                node.id,
                format!("health check timed out after {:?}", self.check_timeout),
            )),
        }
    }

    /// Start background health check task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.check_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptedEngine;
    use crate::probe::MetricsProbe;
    use crate::registry::tests::topology;
    use crate::registry::NodeSample;
    use crate::sampler::MetricsSampler;
    use crate::worker_client::tests::FakeWorkers;
    use async_trait::async_trait;
    use edgeloop_common::config::{CoordinatorConfig, SamplerConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn coordinator_config(threshold: u32) -> CoordinatorConfig {
        let yaml = format!(
            "nodes: []\nfailure_threshold: {}\nhealth_check_timeout_ms: 100\n",
            threshold
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_marks_workers_and_root() {
        let registry = NodeRegistry::new(&topology(2), 8, "m", "t");
        let fake = Arc::new(FakeWorkers::default());
        fake.down.lock().insert(2);
        let engine = Arc::new(ScriptedEngine::new(None, Duration::ZERO));
        let monitor = HealthMonitor::new(
            registry.clone(),
            fake.clone(),
            engine.clone(),
            &coordinator_config(2),
        );

        monitor.check_once().await;
        assert_eq!(registry.node(0).unwrap().health, HealthState::Unknown);
        assert_eq!(registry.node(1).unwrap().health, HealthState::Healthy);
        assert_eq!(registry.node(2).unwrap().health, HealthState::Unknown);

        engine.ensure_running().await.unwrap();
        monitor.check_once().await;
        assert_eq!(registry.node(0).unwrap().health, HealthState::Healthy);
        assert_eq!(registry.node(2).unwrap().health, HealthState::Unreachable);
        assert_eq!(registry.available_workers(), vec![1]);

        // Recovery
        fake.down.lock().clear();
        monitor.check_once().await;
        assert_eq!(registry.available_workers(), vec![1, 2]);
    }

    /// Metrics source that can be switched off
    #[derive(Default)]
    struct SwitchedMetrics {
        broken: AtomicBool,
    }

    #[async_trait]
    impl MetricsProbe for SwitchedMetrics {
        async fn sample(&self, node: &Node) -> Result<NodeSample> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(EdgeLoopError::node_unreachable(node.id, "stats unavailable"));
            }
            Ok(NodeSample {
                cpu_percent: 5.0,
                memory_mb: 64.0,
            })
        }
    }

    #[tokio::test]
    async fn test_sampler_and_health_checks_agree() {
        let registry = NodeRegistry::new(&topology(1), 8, "m", "t");
        let fake = Arc::new(FakeWorkers::default());
        let engine = Arc::new(ScriptedEngine::new(None, Duration::ZERO));
        let monitor = HealthMonitor::new(
            registry.clone(),
            fake.clone(),
            engine.clone(),
            &coordinator_config(2),
        );
        let metrics = Arc::new(SwitchedMetrics::default());
        let config = SamplerConfig {
            probe_timeout_ms: 100,
            failure_threshold: 2,
            ..SamplerConfig::default()
        };
        let sampler = MetricsSampler::new(registry.clone(), metrics.clone(), config);

        sampler.sample_once().await;
        monitor.check_once().await;
        assert_eq!(registry.node(1).unwrap().health, HealthState::Healthy);

        // The agent keeps answering while its metrics are gone
        metrics.broken.store(true, Ordering::SeqCst);
        let mut seen = Vec::new();
        for _ in 0..6 {
            sampler.sample_once().await;
            monitor.check_once().await;
            seen.push(registry.node(1).unwrap().health);
        }
        assert_eq!(seen[0], HealthState::Healthy);
        assert!(seen[1..].iter().all(|h| *h == HealthState::Unreachable));
        assert!(registry.available_workers().is_empty());

        metrics.broken.store(false, Ordering::SeqCst);
        sampler.sample_once().await;
        monitor.check_once().await;
        assert_eq!(registry.node(1).unwrap().health, HealthState::Healthy);
        assert_eq!(registry.available_workers(), vec![1]);
    }
}
