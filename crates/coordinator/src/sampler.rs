//! Periodic node metrics sampling
//!
//! Every tick probes all nodes concurrently. Each probe runs under its own
//! timeout so a slow or dead node never delays the others, and a failed probe
//! only marks that node's values stale.

use crate::probe::MetricsProbe;
use crate::registry::{Node, NodeRegistry};
use edgeloop_common::config::SamplerConfig;
use edgeloop_common::error::{EdgeLoopError, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Samples node metrics into the registry
pub struct MetricsSampler {
    registry: NodeRegistry,
    probe: Arc<dyn MetricsProbe>,
    config: SamplerConfig,
}

impl MetricsSampler {
    pub fn new(registry: NodeRegistry, probe: Arc<dyn MetricsProbe>, config: SamplerConfig) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Probe every node once. Returns the number of successful samples.
    pub async fn sample_once(&self) -> usize {
        let nodes = self.registry.nodes();
        let results = join_all(nodes.iter().map(|node| self.probe_node(node))).await;

        let mut succeeded = 0;
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(sample) => {
                    self.registry.record_sample(node.id, sample);
                    succeeded += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    self.registry
                        .record_sample_failure(node.id, self.config.failure_threshold);
                }
            }
        }
        debug!("Sampled {}/{} nodes", succeeded, nodes.len());
        succeeded
    }

    async fn probe_node(&self, node: &Node) -> Result<crate::registry::NodeSample> {
        match tokio::time::timeout(self.config.probe_timeout(), self.probe.sample(node)).await {
            Ok(result) => result,
            Err(_) => Err(EdgeLoopError::node_unreachable(
                node.id,
                format!("metrics probe timed out after {:?}", self.config.probe_timeout()),
            )),
        }
    }

    /// Start the background sampling loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.sample_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::topology;
    use crate::registry::NodeSample;
    use async_trait::async_trait;
    use edgeloop_proto::HealthState;
    use std::time::Duration;

    /// Node 2 always fails, node 3 hangs
    struct FlakyProbe;

    #[async_trait]
    impl MetricsProbe for FlakyProbe {
        async fn sample(&self, node: &Node) -> Result<NodeSample> {
            match node.id {
                2 => Err(EdgeLoopError::node_unreachable(2, "container gone")),
                3 => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                id => Ok(NodeSample {
                    cpu_percent: 10.0 * id as f32,
                    memory_mb: 100.0,
                }),
            }
        }
    }

    fn sampler() -> (NodeRegistry, MetricsSampler) {
        let registry = NodeRegistry::new(&topology(3), 16, "model", "tokenizer");
        let config = SamplerConfig {
            probe_timeout_ms: 50,
            failure_threshold: 2,
            ..SamplerConfig::default()
        };
        let sampler = MetricsSampler::new(registry.clone(), Arc::new(FlakyProbe), config);
        (registry, sampler)
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let (registry, sampler) = sampler();
        registry.record_health_success(1);
        registry.record_health_success(2);

        let started = std::time::Instant::now();
        assert_eq!(sampler.sample_once().await, 2);
        // The hanging probe is cut off by its timeout
        assert!(started.elapsed() < Duration::from_secs(2));

        let node1 = registry.node(1).unwrap();
        assert_eq!(node1.cpu_percent, Some(10.0));
        assert!(!node1.stale);

        let node2 = registry.node(2).unwrap();
        assert!(node2.stale);
        assert_eq!(node2.health, HealthState::Healthy);
        assert!(registry.node(3).unwrap().stale);
    }

    #[tokio::test]
    async fn test_repeated_failures_mark_unreachable() {
        let (registry, sampler) = sampler();
        registry.record_health_success(2);

        sampler.sample_once().await;
        sampler.sample_once().await;

        assert_eq!(registry.node(2).unwrap().health, HealthState::Unreachable);
        assert_eq!(registry.available_workers(), Vec::<u32>::new());
        // Healthy nodes keep accumulating samples
        let (cpu, _) = registry.window_stats();
        assert_eq!(cpu[&1].avg, 10.0);
    }
}
