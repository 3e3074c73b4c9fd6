//! Token streams between an engine's producer task and its consumer

use edgeloop_common::error::{EdgeLoopError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Tokens buffered between producer and consumer
const STREAM_BUFFER: usize = 64;

/// One generated token
#[derive(Debug, Clone)]
pub struct TokenEvent {
    /// 0-based, increases by one per token of a submission
    pub sequence: u64,
    pub text: String,
    pub emitted_at: Instant,
}

/// Cancellation flag shared by a stream, its producer and the engine
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once `abort` has been called
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Producer half of a token stream
#[derive(Debug)]
pub struct TokenSink {
    tx: mpsc::Sender<Result<TokenEvent>>,
    abort: AbortSignal,
    next_sequence: u64,
    max_tokens: u32,
}

impl TokenSink {
    /// Send one token. Returns `false` once the producer should stop: the
    /// token budget is spent, the stream was aborted, or the consumer is gone.
    pub async fn emit(&mut self, text: impl Into<String>) -> bool {
        if !self.wants_more() {
            return false;
        }

        let event = TokenEvent {
            sequence: self.next_sequence,
            text: text.into(),
            emitted_at: Instant::now(),
        };
        if self.tx.send(Ok(event)).await.is_err() {
            return false;
        }
        self.next_sequence += 1;
        self.wants_more()
    }

    /// End the stream with an error
    pub async fn fail(self, error: EdgeLoopError) {
        let _ = self.tx.send(Err(error)).await;
    }

    pub fn wants_more(&self) -> bool {
        self.next_sequence < u64::from(self.max_tokens)
            && !self.abort.is_aborted()
            && !self.tx.is_closed()
    }

    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }
}

/// Consumer half: a finite, pull-based sequence of tokens.
///
/// Ends when the engine finishes or the token budget is spent. A gap longer
/// than the stall timeout between two tokens ends the stream with
/// `EngineCrashed`.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<Result<TokenEvent>>,
    abort: AbortSignal,
    stall_timeout: Duration,
    finished: bool,
}

impl TokenStream {
    /// Create a connected sink and stream
    pub fn channel(max_tokens: u32, stall_timeout: Duration) -> (TokenSink, TokenStream) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let abort = AbortSignal::new();
        let sink = TokenSink {
            tx,
            abort: abort.clone(),
            next_sequence: 0,
            max_tokens,
        };
        let stream = TokenStream {
            rx,
            abort,
            stall_timeout,
            finished: false,
        };
        (sink, stream)
    }

    /// Next token, `None` at end of generation
    pub async fn next(&mut self) -> Option<Result<TokenEvent>> {
        if self.finished {
            return None;
        }

        match tokio::time::timeout(self.stall_timeout, self.rx.recv()).await {
            Ok(Some(Ok(event))) => Some(Ok(event)),
            Ok(Some(Err(e))) => {
                self.finished = true;
                Some(Err(e))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(_) => {
                self.finished = true;
                self.abort.abort();
                Some(Err(EdgeLoopError::engine_crashed(format!(
                    "no token for {:?}",
                    self.stall_timeout
                ))))
            }
        }
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Stop the producer; no further tokens are delivered
    pub fn abort(&mut self) {
        self.abort.abort();
        self.finished = true;
        self.rx.close();
    }
}
