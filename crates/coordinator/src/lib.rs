//! EdgeLoop Coordinator
//!
//! Root node of a simulated distributed inference run: drives the inference
//! engine, injects synthetic link latency into its token stream and tracks
//! the health and resource usage of every node.

pub mod api;
pub mod coordinator;
pub mod engine;
pub mod health;
pub mod latency;
pub mod probe;
pub mod registry;
pub mod sampler;
pub mod session;
pub mod worker_client;

pub use coordinator::{Coordinator, SessionHandle};
pub use engine::{EngineState, InferenceEngine, ScriptedEngine, TokenEvent, TokenStream};
pub use health::HealthMonitor;
pub use latency::LatencySimulator;
pub use registry::{Node, NodeRegistry, NodeSample};
pub use sampler::MetricsSampler;
pub use session::{clamp_max_tokens, GenerationSession};
pub use worker_client::{WorkerClient, WorkerControl};
