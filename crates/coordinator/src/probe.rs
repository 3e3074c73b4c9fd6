//! Node metrics probes
//!
//! A probe reads the current CPU and memory usage of one node. Nodes of the
//! simulated topology are containers on a single host, so the default probe
//! asks `docker stats`; `HostProbe` reports whole-host figures instead.

use crate::registry::{Node, NodeSample};
use async_trait::async_trait;
use edgeloop_common::config::MetricsSource;
use edgeloop_common::error::{EdgeLoopError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use sysinfo::System;
use tokio::process::Command;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Reads resource usage of a node
#[async_trait]
pub trait MetricsProbe: Send + Sync {
    async fn sample(&self, node: &Node) -> Result<NodeSample>;
}

/// Build the probe selected in configuration
pub fn from_source(source: MetricsSource) -> Arc<dyn MetricsProbe> {
    match source {
        MetricsSource::Docker => Arc::new(DockerStatsProbe::default()),
        MetricsSource::Host => Arc::new(HostProbe::new()),
    }
}

/// Samples a node's container with `docker stats --no-stream`
#[derive(Debug, Clone)]
pub struct DockerStatsProbe {
    docker: PathBuf,
}

impl DockerStatsProbe {
    pub fn new(docker: impl Into<PathBuf>) -> Self {
        Self {
            docker: docker.into(),
        }
    }
}

impl Default for DockerStatsProbe {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl MetricsProbe for DockerStatsProbe {
    async fn sample(&self, node: &Node) -> Result<NodeSample> {
        let output = Command::new(&self.docker)
            .args(["stats", "--no-stream", "--format", "{{json .}}", &node.container])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EdgeLoopError::node_unreachable(node.id, format!("docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EdgeLoopError::node_unreachable(
                node.id,
                format!("docker stats {}: {}", node.container, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| EdgeLoopError::node_unreachable(node.id, "docker stats returned nothing"))?;

        parse_docker_stats(line).map_err(|e| EdgeLoopError::node_unreachable(node.id, e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

/// Parse one `{{json .}}` line of `docker stats`
pub fn parse_docker_stats(line: &str) -> Result<NodeSample> {
    let stats: DockerStatsLine = serde_json::from_str(line)?;

    let cpu_percent = stats
        .cpu_perc
        .trim()
        .trim_end_matches('%')
        .parse::<f32>()
        .map_err(|_| EdgeLoopError::Parse(format!("Bad CPU percentage: {}", stats.cpu_perc)))?;

    // "512MiB / 2GiB": usage, then the limit
    let usage = stats
        .mem_usage
        .split('/')
        .next()
        .unwrap_or_default();
    let memory_mb = parse_size(usage)? / BYTES_PER_MB;

    Ok(NodeSample {
        cpu_percent,
        memory_mb,
    })
}

/// Parse a docker size string such as `512MiB`, `1.5GiB` or `800kB` into bytes
pub fn parse_size(text: &str) -> Result<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| EdgeLoopError::Parse(format!("Bad size: {}", text)))?;

    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => BYTES_PER_MB,
        "GiB" => BYTES_PER_MB * 1024.0,
        "TiB" => BYTES_PER_MB * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        other => return Err(EdgeLoopError::Parse(format!("Unknown size unit: {}", other))),
    };

    Ok(value * multiplier)
}

/// Whole-host CPU and memory, for runs outside containers.
///
/// Every node reports the same figures.
pub struct HostProbe {
    system: Mutex<System>,
}

impl HostProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsProbe for HostProbe {
    async fn sample(&self, _node: &Node) -> Result<NodeSample> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();

        Ok(NodeSample {
            cpu_percent: system.global_cpu_info().cpu_usage(),
            memory_mb: system.used_memory() as f64 / BYTES_PER_MB,
        })
    }
}
