//! Common error types for EdgeLoop
//!
//! This module defines all error types used across the EdgeLoop system.
//! Every variant carries a stable `kind()` tag that ends up in client-facing
//! error events.

use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for EdgeLoop
#[derive(Error, Debug)]
pub enum EdgeLoopError {
    /// Inference engine failed to start or respond
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Inference engine exited or stalled mid-session
    #[error("Engine crashed: {0}")]
    EngineCrashed(String),

    /// A generation session is already in flight
    #[error("Busy: {0}")]
    Busy(String),

    /// Metrics or health sampling failed for one node
    #[error("Node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: u32, reason: String },

    /// The client stopped consuming the stream
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Session cancelled on request
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Illegal state machine transition
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// HTTP communication errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<AddrParseError> for EdgeLoopError {
    fn from(err: AddrParseError) -> Self {
        EdgeLoopError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for EdgeLoopError {
    fn from(err: config::ConfigError) -> Self {
        EdgeLoopError::Config(err.to_string())
    }
}

impl EdgeLoopError {
    /// Stable snake_case tag for this error
    pub fn kind(&self) -> &'static str {
        match self {
            EdgeLoopError::EngineUnavailable(_) => "engine_unavailable",
            EdgeLoopError::EngineCrashed(_) => "engine_crashed",
            EdgeLoopError::Busy(_) => "busy",
            EdgeLoopError::NodeUnreachable { .. } => "node_unreachable",
            EdgeLoopError::ClientDisconnected => "client_disconnected",
            EdgeLoopError::Aborted(_) => "aborted",
            EdgeLoopError::Timeout(_) => "timeout",
            EdgeLoopError::Config(_) => "config",
            EdgeLoopError::InvalidInput(_) => "invalid_input",
            EdgeLoopError::InvalidTransition { .. } => "invalid_transition",
            EdgeLoopError::Http(_) => "http",
            EdgeLoopError::Serialization(_) => "serialization",
            EdgeLoopError::Io(_) => "io",
            EdgeLoopError::Parse(_) => "parse",
        }
    }

    /// Whether the engine process must be restarted after this error
    pub fn requires_engine_restart(&self) -> bool {
        matches!(self, EdgeLoopError::EngineCrashed(_))
    }

    /// Create an engine unavailable error
    pub fn engine_unavailable(msg: impl Into<String>) -> Self {
        EdgeLoopError::EngineUnavailable(msg.into())
    }

    /// Create an engine crashed error
    pub fn engine_crashed(msg: impl Into<String>) -> Self {
        EdgeLoopError::EngineCrashed(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        EdgeLoopError::Busy(msg.into())
    }

    /// Create a node unreachable error
    pub fn node_unreachable(node_id: u32, reason: impl Into<String>) -> Self {
        EdgeLoopError::NodeUnreachable {
            node_id,
            reason: reason.into(),
        }
    }

    /// Create an aborted error
    pub fn aborted(msg: impl Into<String>) -> Self {
        EdgeLoopError::Aborted(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        EdgeLoopError::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EdgeLoopError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        EdgeLoopError::InvalidInput(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        EdgeLoopError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        EdgeLoopError::Http(msg.into())
    }
}

/// Result type alias for EdgeLoop operations
pub type Result<T> = std::result::Result<T, EdgeLoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(EdgeLoopError::busy("x").kind(), "busy");
        assert_eq!(EdgeLoopError::engine_crashed("x").kind(), "engine_crashed");
        assert_eq!(EdgeLoopError::ClientDisconnected.kind(), "client_disconnected");
        assert_eq!(EdgeLoopError::node_unreachable(3, "x").kind(), "node_unreachable");
        assert_eq!(EdgeLoopError::timeout("x").kind(), "timeout");
    }

    #[test]
    fn test_only_crash_requires_restart() {
        assert!(EdgeLoopError::engine_crashed("exit 137").requires_engine_restart());
        assert!(!EdgeLoopError::engine_unavailable("not ready").requires_engine_restart());
        assert!(!EdgeLoopError::aborted("client").requires_engine_restart());
    }

    #[test]
    fn test_display_includes_node() {
        let err = EdgeLoopError::node_unreachable(2, "docker stats failed");
        assert_eq!(err.to_string(), "Node 2 unreachable: docker stats failed");
    }
}
