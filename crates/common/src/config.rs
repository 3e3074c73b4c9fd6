//! Configuration structures for EdgeLoop
//!
//! This module defines all configuration types used by the coordinator and the
//! worker agents. Configurations are loaded from YAML files and can be
//! overridden by `EDGELOOP__`-prefixed environment variables
//! (e.g. `EDGELOOP__PORT=8001`, `EDGELOOP__ENGINE__NTHREADS=8`).

use crate::error::{EdgeLoopError, Result};
use edgeloop_proto::NodeRole;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for EdgeLoop components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeLoopConfig {
    /// Mode: either "worker" or "coordinator"
    pub mode: String,

    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Coordinator-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Worker-agent-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    /// Inference engine configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,

    /// Observability configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Coordinator-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Static topology: one root plus the simulated workers
    pub nodes: Vec<NodeConfig>,

    /// Synthetic link latency
    #[serde(default)]
    pub latency: LatencyConfig,

    /// Node metrics sampling
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Generation session limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Health check interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Timeout of a single worker health check in milliseconds
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,

    /// Consecutive failures before a worker is marked unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// One node of the simulated topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u32,

    pub role: NodeRole,

    /// Worker agent base URL (e.g. `http://worker1:5000`); informational for the root
    pub address: String,

    /// Container name queried by the docker metrics probe
    #[serde(default)]
    pub container: Option<String>,
}

impl NodeConfig {
    /// Host part of the address, without scheme or port
    pub fn host(&self) -> &str {
        host_of(&self.address)
    }
}

/// Host part of a URL such as `http://worker1:5000/`
pub fn host_of(address: &str) -> &str {
    let without_scheme = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    without_scheme
        .split(|c| c == ':' || c == '/')
        .next()
        .unwrap_or(without_scheme)
}

/// Delay bounds of one link, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkLatencyConfig {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl LinkLatencyConfig {
    /// Check `0 <= min <= max`, both finite
    pub fn validate(&self) -> Result<()> {
        if !self.min_secs.is_finite() || !self.max_secs.is_finite() {
            return Err(EdgeLoopError::config("Latency bounds must be finite"));
        }
        if self.min_secs < 0.0 || self.max_secs < 0.0 {
            return Err(EdgeLoopError::config(format!(
                "Latency bounds must be non-negative, got [{}, {}]",
                self.min_secs, self.max_secs
            )));
        }
        if self.min_secs > self.max_secs {
            return Err(EdgeLoopError::config(format!(
                "Latency min {} exceeds max {}",
                self.min_secs, self.max_secs
            )));
        }
        Ok(())
    }
}

/// Latency for the link between the root and one worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LinkOverride {
    /// Worker node id at the far end of the link
    pub node: u32,
    pub min_secs: f64,
    pub max_secs: f64,
}

impl LinkOverride {
    pub fn range(&self) -> LinkLatencyConfig {
        LinkLatencyConfig {
            min_secs: self.min_secs,
            max_secs: self.max_secs,
        }
    }
}

/// Synthetic latency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    /// Global lower bound in seconds
    #[serde(default = "default_latency_min")]
    pub min_secs: f64,

    /// Global upper bound in seconds
    #[serde(default = "default_latency_max")]
    pub max_secs: f64,

    /// Per-link overrides
    #[serde(default)]
    pub links: Vec<LinkOverride>,
}

impl LatencyConfig {
    /// Range shared by every link without an override
    pub fn global(&self) -> LinkLatencyConfig {
        LinkLatencyConfig {
            min_secs: self.min_secs,
            max_secs: self.max_secs,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.global().validate()?;
        for link in &self.links {
            link.range()
                .validate()
                .map_err(|e| EdgeLoopError::config(format!("Link to node {}: {}", link.node, e)))?;
        }
        Ok(())
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            min_secs: default_latency_min(),
            max_secs: default_latency_max(),
            links: Vec::new(),
        }
    }
}

/// Where node metrics come from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricsSource {
    /// `docker stats` against each node's container
    #[default]
    Docker,

    /// Whole-host figures from the local machine
    Host,
}

/// Metrics sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Sampling interval in milliseconds
    #[serde(default = "default_sampler_interval")]
    pub interval_ms: u64,

    /// Samples retained per node
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Consecutive failed samples before a node is marked unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Timeout of a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    #[serde(default)]
    pub source: MetricsSource,
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sampler_interval(),
            window_size: default_window_size(),
            failure_threshold: default_failure_threshold(),
            probe_timeout_ms: default_probe_timeout(),
            source: MetricsSource::default(),
        }
    }
}

/// Generation session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds without a token before the session is declared stalled
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Grace period given to an aborted stream before the engine is restarted
    #[serde(default = "default_abort_grace")]
    pub abort_grace_ms: u64,
}

impl SessionConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: default_stall_timeout(),
            abort_grace_ms: default_abort_grace(),
        }
    }
}

/// Inference engine backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// distributed-llama API server
    #[default]
    Dllama,

    /// In-process scripted engine, no model required
    Scripted,
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,

    /// Engine API server binary
    #[serde(default = "default_engine_binary")]
    pub binary: PathBuf,

    /// Working directory for the engine process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Quantized model file
    pub model_path: PathBuf,

    /// Tokenizer file
    pub tokenizer_path: PathBuf,

    #[serde(default = "default_buffer_float_type")]
    pub buffer_float_type: String,

    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: u32,

    #[serde(default = "default_engine_threads")]
    pub nthreads: u32,

    /// Host the engine API listens on
    #[serde(default = "default_engine_host")]
    pub api_host: String,

    #[serde(default = "default_engine_api_port")]
    pub api_port: u16,

    /// Port of the engine worker process on each worker node
    #[serde(default = "default_worker_engine_port")]
    pub worker_port: u16,

    /// Seconds to wait for the engine to report ready
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_health_poll")]
    pub health_poll_ms: u64,

    #[serde(default)]
    pub scripted: ScriptedEngineConfig,
}

impl EngineConfig {
    /// Model name shown in status queries (file stem of the model path)
    pub fn model_identifier(&self) -> String {
        file_stem(&self.model_path)
    }

    /// Tokenizer name shown in status queries
    pub fn tokenizer_identifier(&self) -> String {
        file_stem(&self.tokenizer_path)
    }

    pub fn api_base_url(&self) -> String {
        format!("http://{}:{}", self.api_host, self.api_port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }
}

/// Scripted engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedEngineConfig {
    /// Delay between tokens in milliseconds
    #[serde(default = "default_token_delay")]
    pub token_delay_ms: u64,

    /// Text to replay word by word; the prompt is echoed when absent
    #[serde(default)]
    pub script: Option<String>,
}

impl Default for ScriptedEngineConfig {
    fn default() -> Self {
        Self {
            token_delay_ms: default_token_delay(),
            script: None,
        }
    }
}

/// Worker-agent-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Node id of this worker in the coordinator topology
    pub worker_id: u32,

    /// Engine binary started in worker mode
    #[serde(default = "default_worker_binary")]
    pub binary: PathBuf,

    /// Port the engine worker process listens on
    #[serde(default = "default_worker_engine_port")]
    pub engine_port: u16,

    #[serde(default = "default_worker_threads")]
    pub nthreads: u32,

    /// Seconds between SIGTERM and SIGKILL on stop
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Start the engine worker when the agent boots
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

impl WorkerConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics on `/metrics`
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_health_check_timeout() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_latency_min() -> f64 {
    0.01 // 10 ms
}

fn default_latency_max() -> f64 {
    0.05 // 50 ms
}

fn default_sampler_interval() -> u64 {
    1000
}

fn default_window_size() -> usize {
    600
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_stall_timeout() -> u64 {
    120
}

fn default_abort_grace() -> u64 {
    2000
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("./dllama-api")
}

fn default_buffer_float_type() -> String {
    "q80".to_string()
}

fn default_max_seq_len() -> u32 {
    2048
}

fn default_engine_threads() -> u32 {
    4
}

fn default_engine_host() -> String {
    "127.0.0.1".to_string()
}

fn default_engine_api_port() -> u16 {
    9999
}

fn default_worker_engine_port() -> u16 {
    9998
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_poll() -> u64 {
    500
}

fn default_token_delay() -> u64 {
    20
}

fn default_worker_binary() -> PathBuf {
    PathBuf::from("/dllama-app/distributed-llama/dllama")
}

fn default_worker_threads() -> u32 {
    1
}

fn default_stop_grace() -> u64 {
    5
}

fn default_autostart() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

const ENV_PREFIX: &str = "EDGELOOP";

impl EdgeLoopConfig {
    /// Load configuration from a YAML file, applying environment overrides
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(EdgeLoopError::Config(format!(
                "Config file {} not found",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                EdgeLoopError::Config(format!("Failed to read config file {}: {}", path.display(), e))
            })?;

        let config: EdgeLoopConfig = settings.try_deserialize().map_err(|e| {
            EdgeLoopError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EdgeLoopConfig = serde_yaml::from_str(content)
            .map_err(|e| EdgeLoopError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "worker" => {
                if self.worker.is_none() {
                    return Err(EdgeLoopError::config("Worker config required for worker mode"));
                }
            }
            "coordinator" => {
                let coordinator = self.coordinator.as_ref().ok_or_else(|| {
                    EdgeLoopError::config("Coordinator config required for coordinator mode")
                })?;
                if self.engine.is_none() {
                    return Err(EdgeLoopError::config("Engine config required for coordinator mode"));
                }
                coordinator.validate()?;
            }
            _ => {
                return Err(EdgeLoopError::config(format!("Invalid mode: {}", self.mode)));
            }
        }
        Ok(())
    }

    /// Get coordinator section
    pub fn coordinator(&self) -> Result<&CoordinatorConfig> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| EdgeLoopError::config("Coordinator config not found"))
    }

    /// Get engine section
    pub fn engine(&self) -> Result<&EngineConfig> {
        self.engine
            .as_ref()
            .ok_or_else(|| EdgeLoopError::config("Engine config not found"))
    }

    /// Get worker section
    pub fn worker(&self) -> Result<&WorkerConfig> {
        self.worker
            .as_ref()
            .ok_or_else(|| EdgeLoopError::config("Worker config not found"))
    }

    /// Log level, falling back to `info`
    pub fn log_level(&self) -> String {
        self.observability
            .as_ref()
            .map(|o| o.log_level.clone())
            .unwrap_or_else(default_log_level)
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        let roots = self.nodes.iter().filter(|n| n.role == NodeRole::Root).count();
        if roots != 1 {
            return Err(EdgeLoopError::config(format!(
                "Exactly one root node required, found {}",
                roots
            )));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id) {
                return Err(EdgeLoopError::config(format!("Duplicate node id {}", node.id)));
            }
        }

        for link in &self.latency.links {
            let target = self.nodes.iter().find(|n| n.id == link.node);
            if !matches!(target, Some(n) if n.role == NodeRole::Worker) {
                return Err(EdgeLoopError::config(format!(
                    "Latency override for node {} does not name a worker",
                    link.node
                )));
            }
        }
        self.latency.validate()?;

        if self.sampler.interval_ms == 0 || self.sampler.window_size == 0 {
            return Err(EdgeLoopError::config(
                "Sampler interval and window size must be positive",
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(EdgeLoopError::config("Health check interval must be positive"));
        }
        Ok(())
    }

    /// Worker nodes, in configuration order
    pub fn workers(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Worker)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const COORDINATOR_YAML: &str = r#"
mode: coordinator
port: 8000
coordinator:
  nodes:
    - { id: 0, role: root, address: "http://backend:8000", container: backend }
    - { id: 1, role: worker, address: "http://worker1:5000", container: worker1 }
    - { id: 2, role: worker, address: "http://worker2:5000", container: worker2 }
  latency:
    min_secs: 0.01
    max_secs: 0.05
    links:
      - { node: 2, min_secs: 0.1, max_secs: 0.2 }
engine:
  model_path: /models/dllama_model_llama32_1b_instruct_q40.m
  tokenizer_path: /models/dllama_tokenizer_llama_3_2.t
"#;

    #[test]
    fn test_coordinator_config_defaults() {
        let config = EdgeLoopConfig::from_yaml_str(COORDINATOR_YAML).unwrap();
        let coordinator = config.coordinator().unwrap();

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(coordinator.nodes.len(), 3);
        assert_eq!(coordinator.workers().count(), 2);
        assert_eq!(coordinator.failure_threshold, 3);
        assert_eq!(coordinator.sampler.source, MetricsSource::Docker);
        assert_eq!(coordinator.session.stall_timeout(), Duration::from_secs(120));

        let engine = config.engine().unwrap();
        assert_eq!(engine.kind, EngineKind::Dllama);
        assert_eq!(engine.api_port, 9999);
        assert_eq!(engine.worker_port, 9998);
        assert_eq!(engine.model_identifier(), "dllama_model_llama32_1b_instruct_q40");
        assert_eq!(engine.tokenizer_identifier(), "dllama_tokenizer_llama_3_2");
    }

    #[test]
    fn test_node_host_strips_scheme_and_port() {
        let config = EdgeLoopConfig::from_yaml_str(COORDINATOR_YAML).unwrap();
        let worker = &config.coordinator().unwrap().nodes[1];
        assert_eq!(worker.host(), "worker1");
    }

    #[test]
    fn test_latency_validation() {
        assert!(LinkLatencyConfig { min_secs: 0.0, max_secs: 0.0 }.validate().is_ok());
        assert!(LinkLatencyConfig { min_secs: 0.05, max_secs: 0.05 }.validate().is_ok());
        assert!(LinkLatencyConfig { min_secs: 0.06, max_secs: 0.05 }.validate().is_err());
        assert!(LinkLatencyConfig { min_secs: -0.01, max_secs: 0.05 }.validate().is_err());
        assert!(LinkLatencyConfig { min_secs: 0.0, max_secs: f64::INFINITY }.validate().is_err());
    }

    #[test]
    fn test_config_validation_missing_root() {
        let yaml = COORDINATOR_YAML.replace("role: root", "role: worker");
        assert!(EdgeLoopConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_config_validation_override_on_unknown_node() {
        let yaml = COORDINATOR_YAML.replace("node: 2,", "node: 7,");
        assert!(EdgeLoopConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_config_validation_missing_worker() {
        let config = EdgeLoopConfig {
            mode: "worker".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 5000,
            coordinator: None,
            worker: None,
            engine: None,
            observability: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "mode: worker\nport: 5000\nworker:\n  worker_id: 3\n  nthreads: 2\n"
        )
        .unwrap();

        let config = EdgeLoopConfig::from_file(file.path()).unwrap();
        let worker = config.worker().unwrap();
        assert_eq!(worker.worker_id, 3);
        assert_eq!(worker.nthreads, 2);
        assert_eq!(worker.engine_port, 9998);
        assert!(worker.autostart);
    }

    #[test]
    fn test_shipped_configs_parse() {
        let coordinator =
            EdgeLoopConfig::from_yaml_str(include_str!("../../../configs/coordinator.yaml"))
                .unwrap();
        assert_eq!(coordinator.coordinator().unwrap().workers().count(), 3);
        assert_eq!(coordinator.engine().unwrap().nthreads, 4);

        let worker =
            EdgeLoopConfig::from_yaml_str(include_str!("../../../configs/worker.yaml")).unwrap();
        assert_eq!(worker.worker().unwrap().worker_id, 1);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(EdgeLoopConfig::from_file("/nonexistent/edgeloop.yaml").is_err());
    }
}
