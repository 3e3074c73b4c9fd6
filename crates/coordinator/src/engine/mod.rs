//! Inference engine adapter
//!
//! The engine is an external text generator wrapped behind `InferenceEngine`.
//! Adapters own the engine's lifecycle, run one submission at a time, and
//! turn its output into a `TokenStream`.

pub mod dllama;
pub mod scripted;
pub mod stream;

pub use dllama::DllamaEngine;
pub use scripted::ScriptedEngine;
pub use stream::{AbortSignal, TokenEvent, TokenSink, TokenStream};

use crate::registry::NodeRegistry;
use crate::worker_client::WorkerControl;
use async_trait::async_trait;
use edgeloop_common::config::{EngineConfig, EngineKind, SessionConfig};
use edgeloop_common::error::Result;
use edgeloop_common::METRICS;
use edgeloop_proto::HealthState;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle state of an engine adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Ready,
    Busy,
    Crashed,
    Unavailable,
}

impl EngineState {
    /// Health of the root node while the engine is in this state
    pub fn node_health(self) -> HealthState {
        match self {
            EngineState::Ready | EngineState::Busy => HealthState::Healthy,
            EngineState::Starting => HealthState::Starting,
            EngineState::Crashed => HealthState::Crashed,
            EngineState::Unavailable => HealthState::Unreachable,
            EngineState::Stopped => HealthState::Unknown,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Ready => "ready",
            EngineState::Busy => "busy",
            EngineState::Crashed => "crashed",
            EngineState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// A text generator that streams tokens
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Start the engine if it is not running. Idempotent.
    ///
    /// Fails with `EngineUnavailable` when the engine is not ready within its
    /// startup timeout.
    async fn ensure_running(&self) -> Result<()>;

    /// Begin generating. Only one submission may be active at a time.
    async fn submit(&self, prompt: &str, max_tokens: u32) -> Result<TokenStream>;

    /// Cancel the active submission and restart the engine
    async fn abort(&self) -> Result<()>;

    /// Stop and start the engine
    async fn restart(&self) -> Result<()>;

    /// Stop the engine for good
    async fn shutdown(&self) -> Result<()>;

    fn state(&self) -> EngineState;
}

/// Build the engine selected in configuration
pub fn from_config(
    config: &EngineConfig,
    session: &SessionConfig,
    registry: NodeRegistry,
    workers: Arc<dyn WorkerControl>,
) -> Arc<dyn InferenceEngine> {
    match config.kind {
        EngineKind::Dllama => Arc::new(DllamaEngine::new(config.clone(), session, registry, workers)),
        EngineKind::Scripted => Arc::new(ScriptedEngine::from_config(config, session)),
    }
}

/// Shared engine state; keeps the readiness gauge in step
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    inner: Arc<Mutex<EngineState>>,
}

impl StateCell {
    pub(crate) fn new(state: EngineState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn get(&self) -> EngineState {
        *self.inner.lock()
    }

    pub(crate) fn set(&self, state: EngineState) {
        let mut current = self.inner.lock();
        if *current != state {
            debug!("Engine state {} -> {}", *current, state);
            *current = state;
        }
        let ready = matches!(state, EngineState::Ready | EngineState::Busy);
        METRICS.engine.ready.set(i64::from(ready));
    }

    /// Move to `to` only if currently in `from`
    pub(crate) fn transition(&self, from: EngineState, to: EngineState) -> bool {
        let mut current = self.inner.lock();
        if *current != from {
            return false;
        }
        *current = to;
        drop(current);
        self.set(to);
        true
    }

    /// Record an unexpected engine failure
    pub(crate) fn crashed(&self, reason: &str) {
        warn!("Engine crashed: {}", reason);
        METRICS.engine.crashes_total.inc();
        self.set(EngineState::Crashed);
    }
}

/// The producer task of the active submission
struct Inflight {
    abort: AbortSignal,
    task: JoinHandle<()>,
}

/// Single-flight slot for submissions
#[derive(Default)]
pub(crate) struct InflightSlot {
    current: Mutex<Option<Inflight>>,
}

impl InflightSlot {
    pub(crate) fn is_active(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|inflight| !inflight.task.is_finished())
    }

    pub(crate) fn begin(&self, abort: AbortSignal, task: JoinHandle<()>) {
        *self.current.lock() = Some(Inflight { abort, task });
    }

    /// Signal the producer and wait up to `grace` for it to stop.
    ///
    /// Returns `false` if the producer had to be killed.
    pub(crate) async fn cancel(&self, grace: Duration) -> bool {
        let Some(inflight) = self.current.lock().take() else {
            return true;
        };
        inflight.abort.abort();

        let mut task = inflight.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Producer did not stop within {:?}, cancelling", grace);
                task.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_health_mirrors_engine() {
        assert_eq!(EngineState::Ready.node_health(), HealthState::Healthy);
        assert_eq!(EngineState::Busy.node_health(), HealthState::Healthy);
        assert_eq!(EngineState::Crashed.node_health(), HealthState::Crashed);
        assert!(!EngineState::Stopped.node_health().is_available());
    }

    #[test]
    fn test_state_transition_is_conditional() {
        let cell = StateCell::new(EngineState::Busy);
        assert!(!cell.transition(EngineState::Ready, EngineState::Stopped));
        assert!(cell.transition(EngineState::Busy, EngineState::Ready));
        assert_eq!(cell.get(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_producer() {
        let slot = InflightSlot::default();
        let abort = AbortSignal::new();
        let waiter = abort.clone();
        slot.begin(abort, tokio::spawn(async move { waiter.aborted().await }));

        assert!(slot.is_active());
        assert!(slot.cancel(Duration::from_secs(1)).await);
        assert!(!slot.is_active());
        // Nothing left to cancel
        assert!(slot.cancel(Duration::from_secs(1)).await);
    }
}
