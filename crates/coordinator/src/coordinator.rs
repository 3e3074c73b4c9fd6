//! Generation session coordinator
//!
//! Accepts one prompt at a time, drives it through the engine, delays every
//! token by the simulated network latency and forwards it to the client
//! together with the current per-node resource stats.

use crate::engine::{AbortSignal, InferenceEngine};
use crate::latency::LatencySimulator;
use crate::registry::NodeRegistry;
use crate::session::GenerationSession;
use edgeloop_common::error::{EdgeLoopError, Result};
use edgeloop_common::METRICS;
use edgeloop_proto::{ErrorFrame, GenerateRequest, SessionState, StreamEvent, TokenFrame};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Events buffered towards a slow client
const EVENT_BUFFER: usize = 64;

/// How long shutdown waits for the active session to wind down
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

struct ActiveSession {
    request_id: String,
    cancel: AbortSignal,
}

#[derive(Default)]
struct Slot {
    active: Mutex<Option<ActiveSession>>,
    idle: Notify,
}

/// Releases the single-flight slot when the session task ends
struct SlotGuard {
    slot: Arc<Slot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.active.lock().take();
        self.slot.idle.notify_waiters();
        METRICS.session.active.dec();
    }
}

/// Client side of a running session
pub struct SessionHandle {
    pub request_id: String,
    events: mpsc::Receiver<StreamEvent>,
}

impl SessionHandle {
    /// Next event; `None` after the terminal event
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.events)
    }
}

/// Serializes generation sessions over one engine
pub struct Coordinator {
    engine: Arc<dyn InferenceEngine>,
    latency: Arc<LatencySimulator>,
    registry: NodeRegistry,
    slot: Arc<Slot>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        latency: Arc<LatencySimulator>,
        registry: NodeRegistry,
    ) -> Self {
        Self {
            engine,
            latency,
            registry,
            slot: Arc::new(Slot::default()),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.engine
    }

    pub fn is_busy(&self) -> bool {
        self.slot.active.lock().is_some()
    }

    /// Accept a prompt. Fails with `Busy` at once if a session is in flight.
    pub fn start(&self, request: GenerateRequest) -> Result<SessionHandle> {
        METRICS.session.requests_total.inc();

        let session = GenerationSession::new(request.prompt, request.max_tokens);
        let cancel = AbortSignal::new();
        {
            let mut active = self.slot.active.lock();
            if let Some(current) = active.as_ref() {
                METRICS.session.busy_rejections_total.inc();
                return Err(EdgeLoopError::busy(format!(
                    "session {} is in progress",
                    current.request_id
                )));
            }
            *active = Some(ActiveSession {
                request_id: session.request_id.clone(),
                cancel: cancel.clone(),
            });
        }
        METRICS.session.active.inc();
        let guard = SlotGuard {
            slot: self.slot.clone(),
        };

        info!(
            request_id = %session.request_id,
            max_tokens = session.max_tokens,
            "Accepted generation request"
        );
        self.registry.set_session(&session.request_id, SessionState::Created);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let request_id = session.request_id.clone();
        let driver = Driver {
            engine: self.engine.clone(),
            latency: self.latency.clone(),
            registry: self.registry.clone(),
            tx,
            cancel,
        };
        tokio::spawn(driver.run(session, guard));

        Ok(SessionHandle {
            request_id,
            events: rx,
        })
    }

    /// Cancel the active session. Returns its request id, if any.
    pub fn abort_active(&self) -> Option<String> {
        let active = self.slot.active.lock();
        let current = active.as_ref()?;
        info!(request_id = %current.request_id, "Aborting generation");
        current.cancel.abort();
        Some(current.request_id.clone())
    }

    /// Abort any session, wait for it to end, then stop the engine
    pub async fn shutdown(&self) -> Result<()> {
        self.abort_active();

        let deadline = Instant::now() + SHUTDOWN_WAIT;
        loop {
            let idle = self.slot.idle.notified();
            if !self.is_busy() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, idle).await.is_err() {
                warn!("Active session did not finish within {:?}", SHUTDOWN_WAIT);
                break;
            }
        }

        self.engine.shutdown().await
    }
}

/// Runs one session to its terminal event
struct Driver {
    engine: Arc<dyn InferenceEngine>,
    latency: Arc<LatencySimulator>,
    registry: NodeRegistry,
    tx: mpsc::Sender<StreamEvent>,
    cancel: AbortSignal,
}

impl Driver {
    async fn run(self, mut session: GenerationSession, _slot: SlotGuard) {
        match self.drive(&mut session).await {
            Ok(()) => self.finish(&mut session).await,
            Err(e) => self.fail(&mut session, e).await,
        }
        // `_slot` drops here, after any engine recovery
    }

    /// Run `step` unless the client leaves or the session is aborted first
    async fn cancellable<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.tx.closed() => Err(EdgeLoopError::ClientDisconnected),
            _ = self.cancel.aborted() => Err(EdgeLoopError::aborted("cancelled on request")),
            result = step => result,
        }
    }

    async fn drive(&self, session: &mut GenerationSession) -> Result<()> {
        self.registry.reset_windows();
        session.dispatch()?;
        self.registry
            .set_session(&session.request_id, SessionState::Dispatching);

        self.cancellable(self.engine.ensure_running()).await?;
        let mut stream = self
            .cancellable(self.engine.submit(&session.prompt, session.max_tokens))
            .await?;
        session.begin_streaming()?;
        self.registry
            .set_session(&session.request_id, SessionState::Streaming);

        loop {
            let next = self.cancellable(async { Ok(stream.next().await) }).await?;
            let Some(event) = next else {
                break;
            };
            let event = event?;

            let delay = self.latency.sample_round(&self.registry.available_workers());
            self.cancellable(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;

            let ttft = session.record_token(delay, Instant::now())?;
            let (cpu_stats, mem_stats) = self.registry.window_stats();
            let frame = TokenFrame {
                seq: event.sequence,
                text: event.text,
                ttft: ttft.map(|d| d.as_secs_f64()),
                total_delay: session.total_delay().as_secs_f64(),
                cpu_stats,
                mem_stats,
            };

            METRICS.session.tokens_total.inc();
            METRICS.session.token_delay.observe(delay.as_secs_f64());
            if let Some(ttft) = ttft {
                METRICS.session.ttft.observe(ttft.as_secs_f64());
            }

            if self.tx.send(StreamEvent::Token(frame)).await.is_err() {
                return Err(EdgeLoopError::ClientDisconnected);
            }
        }
        Ok(())
    }

    async fn finish(&self, session: &mut GenerationSession) {
        if let Err(e) = session.complete() {
            error!("{}", e);
        }
        self.registry
            .set_session(&session.request_id, SessionState::Completed);
        METRICS.session.completed_total.inc();
        METRICS
            .session
            .generation_duration
            .observe(session.generation_time().as_secs_f64());

        let (cpu_stats, mem_stats) = self.registry.window_stats();
        let summary = session.summary(cpu_stats, mem_stats);
        info!(
            request_id = %session.request_id,
            tokens = summary.tokens,
            generation_time = summary.generation_time,
            total_delay = summary.total_delay,
            "Generation completed"
        );
        if self.tx.send(StreamEvent::Summary(summary)).await.is_err() {
            debug!(request_id = %session.request_id, "Client left before the summary");
        }
    }

    async fn fail(self, session: &mut GenerationSession, cause: EdgeLoopError) {
        warn!(request_id = %session.request_id, kind = cause.kind(), "Generation failed: {}", cause);
        // A submitted generation may still be running inside the engine
        let submitted = session.state() == SessionState::Streaming;
        if let Err(e) = session.fail(cause.to_string()) {
            error!("{}", e);
        }
        self.registry
            .set_session(&session.request_id, SessionState::Errored);
        METRICS.session.errored_total.inc();

        let frame = ErrorFrame {
            request_id: session.request_id.clone(),
            kind: cause.kind().to_string(),
            reason: cause.to_string(),
        };
        let _ = self.tx.send(StreamEvent::Error(frame)).await;
        // Ends the client stream before recovery, which may take a full engine start
        drop(self.tx);

        let recovery = if cause.requires_engine_restart() {
            Some(self.engine.restart().await)
        } else if submitted
            && matches!(
                cause,
                EdgeLoopError::Aborted(_) | EdgeLoopError::ClientDisconnected
            )
        {
            Some(self.engine.abort().await)
        } else {
            None
        };
        if let Some(Err(e)) = recovery {
            error!("Engine recovery failed: {}", e);
        }
    }
}
