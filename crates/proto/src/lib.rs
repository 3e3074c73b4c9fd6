//! EdgeLoop wire types
//!
//! JSON shapes exchanged between the coordinator, the worker agents and
//! clients. Everything here is plain serde data; behaviour lives in the
//! coordinator and worker crates.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Literal that terminates every generation stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Token budget used when a request does not carry one.
pub const DEFAULT_MAX_TOKENS: i64 = 256;

// Generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,

    /// Requested token budget. Out-of-range values are clamped by the
    /// coordinator, so any integer is accepted on the wire.
    #[serde(
        default = "default_max_tokens",
        deserialize_with = "saturating_i64"
    )]
    pub max_tokens: i64,
}

fn default_max_tokens() -> i64 {
    DEFAULT_MAX_TOKENS
}

/// Deserialize any integer into an `i64`, saturating at its bounds.
///
/// JSON parsers hand integers beyond 64 bits over as floats, so integral
/// floats are accepted too.
fn saturating_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct SaturatingI64;

    impl<'de> Visitor<'de> for SaturatingI64 {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an integer")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            Ok(i64::try_from(v).unwrap_or(i64::MAX))
        }

        fn visit_i128<E: de::Error>(self, v: i128) -> Result<i64, E> {
            Ok(v.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<i64, E> {
            Ok(i64::try_from(v).unwrap_or(i64::MAX))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
            if !v.is_finite() || v.fract() != 0.0 {
                return Err(E::invalid_value(de::Unexpected::Float(v), &self));
            }
            // `as` saturates float to integer conversions
            Ok(v as i64)
        }
    }

    deserializer.deserialize_any(SaturatingI64)
}

/// `{max, avg}` of one metric over the current session window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStat {
    pub max: f64,
    pub avg: f64,
}

/// Per-node statistics keyed by node id
pub type NodeStats = BTreeMap<u32, MetricStat>;

/// One event of the outbound generation stream.
///
/// Serialized with a `type` tag so clients never have to sniff the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token(TokenFrame),
    Summary(SessionSummary),
    Error(ErrorFrame),
}

impl StreamEvent {
    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFrame {
    /// Position of the token in the generation, starting at 0
    pub seq: u64,

    pub text: String,

    /// Seconds from request acceptance to the first token; first frame only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft: Option<f64>,

    /// Simulated network delay accumulated so far, in seconds
    pub total_delay: f64,

    /// CPU percent per node
    pub cpu_stats: NodeStats,

    /// Memory in megabytes per node
    pub mem_stats: NodeStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub request_id: String,
    pub tokens: u64,

    /// Wall-clock seconds from acceptance to completion
    pub generation_time: f64,

    pub ttft: Option<f64>,
    pub total_delay: f64,
    pub cpu_stats: NodeStats,
    pub mem_stats: NodeStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub request_id: String,

    /// Stable machine-readable error tag (`engine_crashed`, `busy`, ...)
    pub kind: String,

    pub reason: String,
}

/// Role of a node in the simulated topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Root,
    Worker,
}

/// Last-known health of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unreachable,
    Crashed,
}

impl HealthState {
    pub fn is_available(self) -> bool {
        self == HealthState::Healthy
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Unreachable => "unreachable",
            HealthState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a generation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Dispatching,
    Streaming,
    Completed,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Dispatching => "dispatching",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Per-node entry of the status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusView {
    pub id: u32,
    pub role: NodeRole,
    pub address: String,
    pub health_state: HealthState,
    pub is_available: bool,
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,

    /// The last metrics sample failed and the values above are old
    pub stale: bool,

    /// Unix seconds of the last successful health check
    pub last_healthy_at: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionView {
    pub request_id: String,
    pub state: SessionState,
}

/// System-level status summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatusView {
    /// `ok`, `degraded` or `down`
    pub overall_status: String,
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub model_identifier: String,
    pub tokenizer_identifier: String,
    pub engine_state: String,
    pub session: Option<ActiveSessionView>,
}

/// Status document served by a worker agent on `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    pub worker_id: u32,

    /// `online` or `offline`
    pub status: String,

    pub is_available: bool,

    #[serde(default)]
    pub uptime_seconds: f64,
}

/// Reply of the worker agent's start/stop/restart commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommandReply {
    pub worker_id: u32,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of asking one worker agent to restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRestartResult {
    pub worker_id: u32,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// JSON body of every non-streaming error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_tokens(json: &str) -> serde_json::Result<i64> {
        serde_json::from_str::<GenerateRequest>(json).map(|r| r.max_tokens)
    }

    #[test]
    fn test_max_tokens_saturates() {
        assert_eq!(max_tokens(r#"{"prompt":"x"}"#).unwrap(), DEFAULT_MAX_TOKENS);
        assert_eq!(max_tokens(r#"{"prompt":"x","max_tokens":-5}"#).unwrap(), -5);
        assert_eq!(
            max_tokens(r#"{"prompt":"x","max_tokens":18446744073709551615}"#).unwrap(),
            i64::MAX
        );
        assert_eq!(
            max_tokens(r#"{"prompt":"x","max_tokens":99999999999999999999999}"#).unwrap(),
            i64::MAX
        );
        assert_eq!(
            max_tokens(r#"{"prompt":"x","max_tokens":-99999999999999999999999}"#).unwrap(),
            i64::MIN
        );
        assert!(max_tokens(r#"{"prompt":"x","max_tokens":1.5}"#).is_err());
        assert!(max_tokens(r#"{"prompt":"x","max_tokens":"10"}"#).is_err());
    }

    #[test]
    fn test_stream_event_is_tagged() {
        let event = StreamEvent::Token(TokenFrame {
            seq: 0,
            text: "Hi".to_string(),
            ttft: Some(0.25),
            total_delay: 0.02,
            cpu_stats: NodeStats::from([(1, MetricStat { max: 40.0, avg: 20.0 })]),
            mem_stats: NodeStats::new(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["cpu_stats"]["1"]["max"], 40.0);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_ttft_omitted_after_first_token() {
        let event = StreamEvent::Token(TokenFrame {
            seq: 3,
            text: " world".to_string(),
            ttft: None,
            total_delay: 0.1,
            cpu_stats: NodeStats::new(),
            mem_stats: NodeStats::new(),
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("ttft"));
    }

    #[test]
    fn test_generate_request_default_budget() {
        let req: GenerateRequest = serde_json::from_str(r#"{"prompt":"Hello"}"#).unwrap();
        assert_eq!(req.max_tokens, DEFAULT_MAX_TOKENS);

        let req: GenerateRequest =
            serde_json::from_str(r#"{"prompt":"Hello","max_tokens":-4}"#).unwrap();
        assert_eq!(req.max_tokens, -4);
    }

    #[test]
    fn test_worker_status_without_uptime() {
        let report: WorkerStatusReport =
            serde_json::from_str(r#"{"worker_id":2,"status":"online","is_available":true}"#)
                .unwrap();
        assert!(report.is_available);
        assert_eq!(report.uptime_seconds, 0.0);
    }
}
