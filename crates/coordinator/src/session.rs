//! Generation session state machine
//!
//! Created → Dispatching → Streaming → Completed, with Errored reachable from
//! every non-terminal state.

use edgeloop_common::error::{EdgeLoopError, Result};
use edgeloop_proto::{NodeStats, SessionState, SessionSummary};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Smallest token budget a session runs with
pub const MIN_MAX_TOKENS: u32 = 1;

/// Largest token budget a session runs with
pub const MAX_MAX_TOKENS: u32 = 1024;

/// Clamp a requested token budget into `1..=1024`. Out-of-range values are
/// never rejected.
pub fn clamp_max_tokens(requested: i64) -> u32 {
    requested.clamp(i64::from(MIN_MAX_TOKENS), i64::from(MAX_MAX_TOKENS)) as u32
}

/// One prompt's trip through the engine
#[derive(Debug)]
pub struct GenerationSession {
    pub request_id: String,
    pub prompt: String,
    pub max_tokens: u32,
    state: SessionState,
    tokens: u64,
    accepted_at: Instant,
    finished_at: Option<Instant>,
    ttft: Option<Duration>,
    total_delay: Duration,
    failure: Option<String>,
}

impl GenerationSession {
    pub fn new(prompt: impl Into<String>, requested_max_tokens: i64) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            max_tokens: clamp_max_tokens(requested_max_tokens),
            state: SessionState::Created,
            tokens: 0,
            accepted_at: Instant::now(),
            finished_at: None,
            ttft: None,
            total_delay: Duration::ZERO,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, from: SessionState, to: SessionState) -> Result<()> {
        if self.state != from {
            return Err(EdgeLoopError::invalid_transition(self.state, to));
        }
        self.state = to;
        Ok(())
    }

    /// Created → Dispatching
    pub fn dispatch(&mut self) -> Result<()> {
        self.advance(SessionState::Created, SessionState::Dispatching)
    }

    /// Dispatching → Streaming
    pub fn begin_streaming(&mut self) -> Result<()> {
        self.advance(SessionState::Dispatching, SessionState::Streaming)
    }

    /// Account for a token emitted to the client after `delay` of simulated
    /// latency. Returns the TTFT if this was the first token.
    pub fn record_token(&mut self, delay: Duration, emitted_at: Instant) -> Result<Option<Duration>> {
        if self.state != SessionState::Streaming {
            return Err(EdgeLoopError::invalid_transition(self.state, "token"));
        }
        self.tokens += 1;
        self.total_delay += delay;

        if self.ttft.is_some() {
            return Ok(None);
        }
        let ttft = emitted_at.saturating_duration_since(self.accepted_at);
        self.ttft = Some(ttft);
        Ok(Some(ttft))
    }

    /// Streaming → Completed
    pub fn complete(&mut self) -> Result<()> {
        self.advance(SessionState::Streaming, SessionState::Completed)?;
        self.finished_at = Some(Instant::now());
        Ok(())
    }

    /// Any non-terminal state → Errored
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(EdgeLoopError::invalid_transition(self.state, SessionState::Errored));
        }
        self.state = SessionState::Errored;
        self.finished_at = Some(Instant::now());
        self.failure = Some(reason.into());
        Ok(())
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn ttft(&self) -> Option<Duration> {
        self.ttft
    }

    pub fn total_delay(&self) -> Duration {
        self.total_delay
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Time since acceptance, frozen once the session ends
    pub fn generation_time(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.accepted_at)
    }

    pub fn summary(&self, cpu_stats: NodeStats, mem_stats: NodeStats) -> SessionSummary {
        SessionSummary {
            request_id: self.request_id.clone(),
            tokens: self.tokens,
            generation_time: self.generation_time().as_secs_f64(),
            ttft: self.ttft.map(|d| d.as_secs_f64()),
            total_delay: self.total_delay.as_secs_f64(),
            cpu_stats,
            mem_stats,
        }
    }
}
