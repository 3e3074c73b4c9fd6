//! EdgeLoop Worker
//!
//! Per-node agent that supervises the inference engine's worker process and
//! reports its state to the coordinator over HTTP.

pub mod agent;
pub mod api;

pub use agent::WorkerAgent;
