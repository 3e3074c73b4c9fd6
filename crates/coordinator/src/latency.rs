//! Synthetic link latency
//!
//! Every worker link draws a delay uniformly from its configured range. A
//! decode step fans out to all available workers and waits for the slowest
//! one, so a step costs the maximum of the per-link draws.

use edgeloop_common::config::{LatencyConfig, LinkLatencyConfig};
use edgeloop_common::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;

/// Draws per-link delays from configured ranges
pub struct LatencySimulator {
    global: LinkLatencyConfig,
    links: HashMap<u32, LinkLatencyConfig>,
    rng: Mutex<StdRng>,
}

impl LatencySimulator {
    /// Create a simulator seeded from OS entropy
    pub fn new(config: &LatencyConfig) -> Result<Self> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a deterministic simulator
    pub fn with_seed(config: &LatencyConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &LatencyConfig, rng: StdRng) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            global: config.global(),
            links: config
                .links
                .iter()
                .map(|link| (link.node, link.range()))
                .collect(),
            rng: Mutex::new(rng),
        })
    }

    /// Range in effect for the link to `node`
    pub fn range(&self, node: u32) -> LinkLatencyConfig {
        self.links.get(&node).copied().unwrap_or(self.global)
    }

    /// Draw one delay for the link to `node`
    pub fn sample(&self, node: u32) -> Duration {
        let range = self.range(node);
        let mut rng = self.rng.lock();
        Duration::from_secs_f64(draw(&mut *rng, range))
    }

    /// Delay of one decode step across `nodes`: the slowest link wins.
    ///
    /// Zero when no worker takes part.
    pub fn sample_round(&self, nodes: &[u32]) -> Duration {
        let mut rng = self.rng.lock();
        nodes
            .iter()
            .map(|node| draw(&mut *rng, self.range(*node)))
            .fold(Duration::ZERO, |slowest, secs| {
                slowest.max(Duration::from_secs_f64(secs))
            })
    }

    /// Whether every configured range is disabled
    pub fn is_disabled(&self) -> bool {
        self.global.max_secs == 0.0 && self.links.values().all(|r| r.max_secs == 0.0)
    }
}

fn draw<R: Rng>(rng: &mut R, range: LinkLatencyConfig) -> f64 {
    if range.max_secs == 0.0 {
        return 0.0;
    }
    if range.min_secs == range.max_secs {
        return range.min_secs;
    }
    rng.gen_range(range.min_secs..=range.max_secs)
}
