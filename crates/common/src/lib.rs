//! EdgeLoop common library
//!
//! This crate contains shared code used across EdgeLoop components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod process;
pub mod signal;

// Re-export commonly used types
pub use config::EdgeLoopConfig;
pub use error::{EdgeLoopError, Result};
pub use metrics::{MetricsRegistry, METRICS};
pub use process::{ManagedProcess, ProcessExit, ProcessSpec};
pub use signal::shutdown_signal;
