//! In-process engine that replays a fixed text
//!
//! Emits the words of a configured script (or of the prompt) with a fixed
//! delay between them. Failure modes can be injected for testing: a slow or
//! failing start, a crash after N tokens, or a stall after N tokens.

use super::{EngineState, InferenceEngine, InflightSlot, StateCell, TokenSink, TokenStream};
use async_trait::async_trait;
use edgeloop_common::config::{EngineConfig, SessionConfig};
use edgeloop_common::error::{EdgeLoopError, Result};
use edgeloop_common::METRICS;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Deterministic engine without a model
pub struct ScriptedEngine {
    script: Option<String>,
    token_delay: Duration,
    stall_timeout: Duration,
    abort_grace: Duration,
    crash_after: Mutex<Option<u64>>,
    stall_after: Mutex<Option<u64>>,
    fail_start: AtomicBool,
    start_delay: Mutex<Duration>,
    state: StateCell,
    inflight: InflightSlot,
    starts: AtomicU64,
    restarts: AtomicU64,
    last_prompt: Mutex<Option<String>>,
}

impl ScriptedEngine {
    /// Engine echoing the prompt with `token_delay` between words
    pub fn new(script: Option<String>, token_delay: Duration) -> Self {
        let session = SessionConfig::default();
        Self {
            script,
            token_delay,
            stall_timeout: session.stall_timeout(),
            abort_grace: session.abort_grace(),
            crash_after: Mutex::new(None),
            stall_after: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            state: StateCell::new(EngineState::Stopped),
            inflight: InflightSlot::default(),
            starts: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EngineConfig, session: &SessionConfig) -> Self {
        Self::new(
            config.scripted.script.clone(),
            Duration::from_millis(config.scripted.token_delay_ms),
        )
        .with_stall_timeout(session.stall_timeout())
        .with_abort_grace(session.abort_grace())
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    /// Crash the next submission after `tokens` tokens
    pub fn crash_after(&self, tokens: u64) {
        *self.crash_after.lock() = Some(tokens);
    }

    /// Stop producing (without ending the stream) after `tokens` tokens of
    /// the next submission
    pub fn stall_after(&self, tokens: u64) {
        *self.stall_after.lock() = Some(tokens);
    }

    /// Make starts fail until cleared
    pub fn set_start_failure(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Time every start (and restart) takes from now on
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().clone()
    }

    async fn start(&self) -> Result<()> {
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            self.state.set(EngineState::Starting);
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            self.state.set(EngineState::Unavailable);
            return Err(EdgeLoopError::engine_unavailable("scripted engine failed to start"));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        METRICS.engine.starts_total.inc();
        self.state.set(EngineState::Ready);
        info!("Scripted engine ready");
        Ok(())
    }

    fn tokens(&self, prompt: &str) -> Vec<String> {
        let text = self.script.as_deref().unwrap_or(prompt);
        text.split_whitespace()
            .enumerate()
            .map(|(i, word)| if i == 0 { word.to_string() } else { format!(" {}", word) })
            .collect()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn ensure_running(&self) -> Result<()> {
        match self.state.get() {
            EngineState::Ready | EngineState::Busy => Ok(()),
            EngineState::Crashed => self.restart().await,
            _ => self.start().await,
        }
    }

    async fn submit(&self, prompt: &str, max_tokens: u32) -> Result<TokenStream> {
        if self.inflight.is_active() {
            return Err(EdgeLoopError::busy("engine is generating"));
        }
        if !self.state.transition(EngineState::Ready, EngineState::Busy) {
            return Err(EdgeLoopError::engine_unavailable(format!(
                "engine is {}",
                self.state.get()
            )));
        }

        *self.last_prompt.lock() = Some(prompt.to_string());
        let (sink, stream) = TokenStream::channel(max_tokens, self.stall_timeout);
        let producer = Producer {
            tokens: self.tokens(prompt),
            token_delay: self.token_delay,
            crash_after: self.crash_after.lock().take(),
            stall_after: self.stall_after.lock().take(),
            state: self.state.clone(),
        };

        let abort = sink.abort_signal().clone();
        let task = tokio::spawn(producer.run(sink));
        self.inflight.begin(abort, task);
        Ok(stream)
    }

    async fn abort(&self) -> Result<()> {
        METRICS.engine.aborts_total.inc();
        self.inflight.cancel(self.abort_grace).await;
        self.restart().await
    }

    async fn restart(&self) -> Result<()> {
        self.inflight.cancel(self.abort_grace).await;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        METRICS.engine.restarts_total.inc();
        self.state.set(EngineState::Starting);
        self.start().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inflight.cancel(self.abort_grace).await;
        self.state.set(EngineState::Stopped);
        Ok(())
    }

    fn state(&self) -> EngineState {
        self.state.get()
    }
}

struct Producer {
    tokens: Vec<String>,
    token_delay: Duration,
    crash_after: Option<u64>,
    stall_after: Option<u64>,
    state: StateCell,
}

impl Producer {
    async fn run(self, mut sink: TokenSink) {
        let abort = sink.abort_signal().clone();

        for token in self.tokens {
            let emitted = sink.emitted();
            if self.crash_after == Some(emitted) {
                let reason = format!("scripted crash after {} tokens", emitted);
                self.state.crashed(&reason);
                sink.fail(EdgeLoopError::engine_crashed(reason)).await;
                return;
            }
            if self.stall_after == Some(emitted) {
                abort.aborted().await;
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.token_delay) => {}
                _ = abort.aborted() => break,
            }
            if !sink.emit(token).await {
                break;
            }
        }

        self.state.transition(EngineState::Busy, EngineState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: &mut TokenStream) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        while let Some(event) = stream.next().await {
            tokens.push(event?.text);
        }
        Ok(tokens)
    }

    #[tokio::test]
    async fn test_echoes_prompt() {
        let engine = ScriptedEngine::new(None, Duration::ZERO);
        engine.ensure_running().await.unwrap();
        engine.ensure_running().await.unwrap();
        assert_eq!(engine.start_count(), 1);

        let mut stream = engine.submit("hello distributed world", 16).await.unwrap();
        let tokens = collect(&mut stream).await.unwrap();
        assert_eq!(tokens, vec!["hello", " distributed", " world"]);
        assert_eq!(engine.last_prompt().as_deref(), Some("hello distributed world"));
    }

    #[tokio::test]
    async fn test_budget_limits_tokens() {
        let engine = ScriptedEngine::new(Some("a b c d e f".to_string()), Duration::ZERO);
        engine.ensure_running().await.unwrap();

        let mut stream = engine.submit("ignored", 4).await.unwrap();
        assert_eq!(collect(&mut stream).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let engine = ScriptedEngine::new(Some("a b c".to_string()), Duration::from_secs(60));
        engine.ensure_running().await.unwrap();

        let _stream = engine.submit("x", 8).await.unwrap();
        assert_eq!(engine.state(), EngineState::Busy);
        assert!(matches!(
            engine.submit("y", 8).await,
            Err(EdgeLoopError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_crash_marks_engine_crashed() {
        let engine = ScriptedEngine::new(Some("a b c d".to_string()), Duration::ZERO);
        engine.ensure_running().await.unwrap();
        engine.crash_after(2);

        let mut stream = engine.submit("x", 8).await.unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await,
            Some(Err(EdgeLoopError::EngineCrashed(_)))
        ));
        assert_eq!(engine.state(), EngineState::Crashed);

        // No automatic restart; the next ensure_running brings it back
        engine.ensure_running().await.unwrap();
        assert_eq!(engine.restart_count(), 1);
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let engine = ScriptedEngine::new(None, Duration::ZERO);
        engine.set_start_failure(true);
        assert!(matches!(
            engine.ensure_running().await,
            Err(EdgeLoopError::EngineUnavailable(_))
        ));
        assert!(engine.submit("x", 1).await.is_err());

        engine.set_start_failure(false);
        engine.ensure_running().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[tokio::test]
    async fn test_abort_restarts() {
        let engine = ScriptedEngine::new(Some("a b c".to_string()), Duration::from_secs(60));
        engine.ensure_running().await.unwrap();
        let mut stream = engine.submit("x", 8).await.unwrap();

        engine.abort().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(engine.restart_count(), 1);
        assert_eq!(engine.state(), EngineState::Ready);
    }
}
