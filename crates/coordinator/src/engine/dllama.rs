//! distributed-llama engine adapter
//!
//! Runs `dllama-api` as a supervised child process on the root node, wired to
//! the engine worker process of every worker node. Generation goes through its
//! OpenAI-compatible chat completions endpoint with `stream: true`; tokens are
//! read from the SSE body as they arrive.

use super::{EngineState, InferenceEngine, InflightSlot, StateCell, TokenSink, TokenStream};
use crate::registry::{Node, NodeRegistry};
use crate::worker_client::{start_unavailable, WorkerControl};
use async_trait::async_trait;
use edgeloop_common::config::{EngineConfig, SessionConfig};
use edgeloop_common::error::{EdgeLoopError, Result};
use edgeloop_common::{ManagedProcess, ProcessExit, ProcessSpec, METRICS};
use edgeloop_proto::DONE_SENTINEL;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// SIGTERM to SIGKILL grace for the engine process
const ENGINE_STOP_GRACE: Duration = Duration::from_secs(5);

/// Timeout of one readiness probe
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

type ExitWatch = watch::Receiver<Option<ProcessExit>>;

/// Adapter for the distributed-llama API server
pub struct DllamaEngine {
    config: EngineConfig,
    stall_timeout: Duration,
    abort_grace: Duration,
    registry: NodeRegistry,
    workers: Arc<dyn WorkerControl>,
    http: reqwest::Client,
    process: tokio::sync::Mutex<Option<ManagedProcess>>,
    exit: Mutex<Option<ExitWatch>>,
    state: StateCell,
    inflight: InflightSlot,
}

impl DllamaEngine {
    pub fn new(
        config: EngineConfig,
        session: &SessionConfig,
        registry: NodeRegistry,
        workers: Arc<dyn WorkerControl>,
    ) -> Self {
        Self {
            config,
            stall_timeout: session.stall_timeout(),
            abort_grace: session.abort_grace(),
            registry,
            workers,
            http: reqwest::Client::new(),
            process: tokio::sync::Mutex::new(None),
            exit: Mutex::new(None),
            state: StateCell::new(EngineState::Stopped),
            inflight: InflightSlot::default(),
        }
    }

    /// Stop whatever runs in `slot`, then start a fresh engine process
    async fn start_locked(&self, slot: &mut Option<ManagedProcess>) -> Result<()> {
        if let Some(mut old) = slot.take() {
            if let Err(e) = old.stop(ENGINE_STOP_GRACE).await {
                warn!("Failed to stop previous engine process: {}", e);
            }
        }
        self.state.set(EngineState::Starting);

        let workers = self.registry.workers();
        start_unavailable(self.workers.as_ref(), &workers).await;

        let spec = process_spec(&self.config, &workers);
        let mut process = ManagedProcess::spawn(&spec).map_err(|e| {
            self.state.set(EngineState::Unavailable);
            EdgeLoopError::engine_unavailable(e.to_string())
        })?;
        *self.exit.lock() = Some(process.exit_watch());

        match self.wait_ready(&process).await {
            Ok(()) => {
                info!(
                    "Engine ready at {} (pid {:?}, {} workers)",
                    self.config.api_base_url(),
                    process.pid(),
                    workers.len()
                );
                METRICS.engine.starts_total.inc();
                *slot = Some(process);
                self.state.set(EngineState::Ready);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = process.stop(ENGINE_STOP_GRACE).await {
                    warn!("Failed to stop engine after failed start: {}", stop_err);
                }
                *self.exit.lock() = None;
                self.state.set(EngineState::Unavailable);
                Err(e)
            }
        }
    }

    /// Poll the models endpoint until the server answers
    async fn wait_ready(&self, process: &ManagedProcess) -> Result<()> {
        let url = format!("{}/v1/models", self.config.api_base_url());
        let deadline = Instant::now() + self.config.startup_timeout();

        loop {
            if let Some(exit) = process.exit_status() {
                return Err(EdgeLoopError::engine_unavailable(format!(
                    "engine exited during startup ({})",
                    exit.describe()
                )));
            }

            match self.http.get(&url).timeout(READY_PROBE_TIMEOUT).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => debug!("Engine not ready: HTTP {}", response.status()),
                Err(e) => debug!("Engine not ready: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(EdgeLoopError::engine_unavailable(format!(
                    "engine not ready within {:?}",
                    self.config.startup_timeout()
                )));
            }
            tokio::time::sleep(self.config.health_poll()).await;
        }
    }

    fn process_has_crashed(&self) -> Option<ProcessExit> {
        let exit = self.exit.lock();
        let exit = exit.as_ref()?.borrow().clone()?;
        (!exit.requested).then_some(exit)
    }
}

#[async_trait]
impl InferenceEngine for DllamaEngine {
    async fn ensure_running(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        let running = process.as_ref().is_some_and(ManagedProcess::is_running);
        if running && matches!(self.state(), EngineState::Ready | EngineState::Busy) {
            return Ok(());
        }
        self.start_locked(&mut process).await
    }

    async fn submit(&self, prompt: &str, max_tokens: u32) -> Result<TokenStream> {
        if self.inflight.is_active() {
            return Err(EdgeLoopError::busy("engine is generating"));
        }
        let state = self.state();
        if !self.state.transition(EngineState::Ready, EngineState::Busy) {
            return Err(EdgeLoopError::engine_unavailable(format!("engine is {}", state)));
        }
        // Back to ready on any early return, including a dropped call
        let mut busy = BusyGuard {
            state: self.state.clone(),
            armed: true,
        };

        let body = json!({
            "messages": [{ "role": "user", "content": prompt }],
            "stream": true,
            "max_tokens": max_tokens,
        });
        let url = format!("{}/v1/chat/completions", self.config.api_base_url());
        let request = self.http.post(&url).json(&body).send();

        let response = match tokio::time::timeout(self.stall_timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => response,
            Ok(Ok(response)) => {
                return Err(EdgeLoopError::engine_unavailable(format!(
                    "completion request failed: HTTP {}",
                    response.status()
                )));
            }
            Ok(Err(e)) => {
                if let Some(exit) = self.process_has_crashed() {
                    self.state.crashed(&exit.describe());
                    return Err(EdgeLoopError::engine_crashed(exit.describe()));
                }
                return Err(EdgeLoopError::engine_unavailable(e.to_string()));
            }
            Err(_) => {
                self.state.crashed("completion request timed out");
                return Err(EdgeLoopError::engine_crashed(format!(
                    "no response within {:?}",
                    self.stall_timeout
                )));
            }
        };
        // The producer owns the busy state from here on
        busy.armed = false;

        let (sink, stream) = TokenStream::channel(max_tokens, self.stall_timeout);
        let abort = sink.abort_signal().clone();
        let exit = self.exit.lock().clone();
        let task = tokio::spawn(produce(response, sink, exit, self.state.clone()));
        self.inflight.begin(abort, task);
        Ok(stream)
    }

    async fn abort(&self) -> Result<()> {
        METRICS.engine.aborts_total.inc();
        if !self.inflight.cancel(self.abort_grace).await {
            warn!("Engine producer ignored abort");
        }
        self.restart().await
    }

    async fn restart(&self) -> Result<()> {
        self.inflight.cancel(self.abort_grace).await;
        METRICS.engine.restarts_total.inc();
        info!("Restarting engine");
        let mut process = self.process.lock().await;
        self.start_locked(&mut process).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inflight.cancel(self.abort_grace).await;
        let mut process = self.process.lock().await;
        if let Some(mut running) = process.take() {
            running.stop(ENGINE_STOP_GRACE).await?;
        }
        *self.exit.lock() = None;
        self.state.set(EngineState::Stopped);
        Ok(())
    }

    fn state(&self) -> EngineState {
        let state = self.state.get();
        if matches!(state, EngineState::Ready | EngineState::Busy) {
            if let Some(exit) = self.process_has_crashed() {
                self.state.crashed(&exit.describe());
                return EngineState::Crashed;
            }
        }
        state
    }
}

/// Returns a busy engine to ready when dropped
struct BusyGuard {
    state: StateCell,
    armed: bool,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.transition(EngineState::Busy, EngineState::Ready);
        }
    }
}

/// Read the SSE body into the sink until `[DONE]`, abort or process exit
async fn produce(
    response: reqwest::Response,
    mut sink: TokenSink,
    mut exit: Option<ExitWatch>,
    state: StateCell,
) {
    let abort = sink.abort_signal().clone();
    let mut body = Box::pin(response.bytes_stream());
    let mut buffer: Vec<u8> = Vec::new();

    'read: loop {
        tokio::select! {
            _ = abort.aborted() => break 'read,
            exited = process_exit(&mut exit) => {
                if exited.requested {
                    break 'read;
                }
                let reason = format!("engine process died ({})", exited.describe());
                state.crashed(&reason);
                sink.fail(EdgeLoopError::engine_crashed(reason)).await;
                return;
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let raw: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw);
                        match parse_sse_line(&line) {
                            Ok(SseLine::Token(text)) => {
                                if !sink.emit(text).await {
                                    break 'read;
                                }
                            }
                            Ok(SseLine::Done) => break 'read,
                            Ok(SseLine::Skip) => {}
                            Err(e) => warn!("Skipping malformed engine event: {}", e),
                        }
                    }
                }
                Some(Err(e)) => {
                    if abort.is_aborted() {
                        break 'read;
                    }
                    let reason = format!("token stream broken: {}", e);
                    state.crashed(&reason);
                    sink.fail(EdgeLoopError::engine_crashed(reason)).await;
                    return;
                }
                None => break 'read,
            }
        }
    }

    state.transition(EngineState::Busy, EngineState::Ready);
}

/// Resolves when the watched process ends; never when there is none
async fn process_exit(exit: &mut Option<ExitWatch>) -> ProcessExit {
    if let Some(rx) = exit.as_mut() {
        if let Ok(value) = rx.wait_for(Option::is_some).await {
            if let Some(exit) = value.clone() {
                return exit;
            }
        }
    }
    futures::future::pending().await
}

/// One line of the completions SSE body
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseLine {
    Token(String),
    Done,
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Ok(SseLine::Done);
    }

    let value: serde_json::Value = serde_json::from_str(payload)?;
    match value["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Ok(SseLine::Token(text.to_string())),
        _ => Ok(SseLine::Skip),
    }
}

/// Command line of the engine API server
pub(crate) fn process_spec(config: &EngineConfig, workers: &[Node]) -> ProcessSpec {
    let mut spec = ProcessSpec::new("dllama-api", config.binary.clone())
        .args([
            "--model".to_string(),
            config.model_path.display().to_string(),
            "--tokenizer".to_string(),
            config.tokenizer_path.display().to_string(),
            "--buffer-float-type".to_string(),
            config.buffer_float_type.clone(),
            "--max-seq-len".to_string(),
            config.max_seq_len.to_string(),
            "--nthreads".to_string(),
            config.nthreads.to_string(),
            "--port".to_string(),
            config.api_port.to_string(),
        ])
        .working_dir(config.working_dir.clone());

    if !workers.is_empty() {
        spec = spec.arg("--workers").args(
            workers
                .iter()
                .map(|w| format!("{}:{}", w.host(), config.worker_port)),
        );
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::topology;
    use crate::worker_client::tests::{worker, FakeWorkers};
    use edgeloop_proto::HealthState;

    fn engine_config() -> EngineConfig {
        let yaml = r#"
model_path: /models/llama/dllama_model_llama.m
tokenizer_path: /models/llama/dllama_tokenizer_llama.t
working_dir: /app/distributed-llama
startup_timeout_secs: 1
health_poll_ms: 50
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_sse_line() {
        let token = r#"data: {"choices":[{"index":0,"delta":{"content":" world"}}]}"#;
        assert_eq!(parse_sse_line(token).unwrap(), SseLine::Token(" world".to_string()));
        assert_eq!(parse_sse_line("data: [DONE]\n").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);

        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(role_only).unwrap(), SseLine::Skip);
        assert!(parse_sse_line("data: {broken").is_err());
    }

    #[test]
    fn test_process_spec() {
        let config = engine_config();
        let workers = vec![worker(1, HealthState::Healthy), worker(2, HealthState::Unknown)];
        let spec = process_spec(&config, &workers);

        assert_eq!(
            spec.command_line(),
            "./dllama-api --model /models/llama/dllama_model_llama.m \
             --tokenizer /models/llama/dllama_tokenizer_llama.t --buffer-float-type q80 \
             --max-seq-len 2048 --nthreads 4 --port 9999 --workers worker1:9998 worker2:9998"
        );
        assert_eq!(spec.working_dir.as_deref(), Some(std::path::Path::new("/app/distributed-llama")));
    }

    #[test]
    fn test_process_spec_without_workers() {
        let spec = process_spec(&engine_config(), &[]);
        assert!(!spec.args.contains(&"--workers".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let mut config = engine_config();
        config.binary = "/nonexistent/dllama-api".into();
        let registry = NodeRegistry::new(&topology(2), 8, "m", "t");
        let fake = Arc::new(FakeWorkers::default());
        let engine = DllamaEngine::new(config, &SessionConfig::default(), registry, fake.clone());

        let result = engine.ensure_running().await;
        assert!(matches!(result, Err(EdgeLoopError::EngineUnavailable(_))));
        assert_eq!(engine.state(), EngineState::Unavailable);
        // Workers were asked to start first
        assert_eq!(*fake.started.lock(), vec![1, 2]);
        assert!(engine.submit("hi", 4).await.is_err());
    }

    /// Stand-in for the dllama API server. The prompt picks the behaviour
    /// of the completions stream.
    async fn serve_stub() -> u16 {
        use axum::{body::Body, http::header, response::IntoResponse, routing, Json, Router};
        use futures::stream::{self, BoxStream};

        type Chunks = BoxStream<'static, std::result::Result<String, std::io::Error>>;

        fn event(text: &str) -> String {
            let payload = json!({ "choices": [{ "index": 0, "delta": { "content": text } }] });
            format!("data: {}\n\n", payload)
        }

        async fn completions(Json(body): Json<serde_json::Value>) -> axum::response::Response {
            let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
            let opening = [event("one"), event(" two")];
            let chunks: Chunks = match prompt {
                "hang" => stream::iter(opening.map(Ok)).chain(stream::pending()).boxed(),
                "break" => stream::iter(opening.map(Ok))
                    .chain(stream::once(async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(std::io::Error::other("connection reset"))
                    }))
                    .boxed(),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    stream::empty().boxed()
                }
                _ => {
                    // Small pieces so events straddle chunk boundaries
                    let mut text = String::from(": warming up\n\n");
                    for word in ["one", " two", " three", " four", " five"] {
                        text.push_str(&event(word));
                    }
                    text.push_str("data: [DONE]\n\n");
                    let pieces: Vec<String> = text
                        .as_bytes()
                        .chunks(7)
                        .map(|c| String::from_utf8_lossy(c).into_owned())
                        .collect();
                    stream::iter(pieces)
                        .then(|piece| async move {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                            Ok(piece)
                        })
                        .boxed()
                }
            };
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(chunks),
            )
                .into_response()
        }

        let app = Router::new()
            .route(
                "/v1/models",
                routing::get(|| async { Json(json!({ "object": "list", "data": [] })) }),
            )
            .route("/v1/chat/completions", routing::post(completions));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await });
        port
    }

    /// Engine whose process is a script that idles, talking to the stub
    #[cfg(unix)]
    async fn stub_engine(name: &str) -> DllamaEngine {
        use std::os::unix::fs::PermissionsExt;

        let script = std::env::temp_dir().join(format!("edgeloop-dllama-{}-{}", name, std::process::id()));
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let yaml = format!(
            "binary: {}\nmodel_path: /models/m\ntokenizer_path: /models/t\n\
             api_host: 127.0.0.1\napi_port: {}\nstartup_timeout_secs: 5\nhealth_poll_ms: 50\n",
            script.display(),
            serve_stub().await
        );
        let config: EngineConfig = serde_yaml::from_str(&yaml).unwrap();
        let session = SessionConfig {
            stall_timeout_secs: 5,
            abort_grace_ms: 200,
        };
        let registry = NodeRegistry::new(&topology(1), 8, "m", "t");
        DllamaEngine::new(config, &session, registry, Arc::new(FakeWorkers::default()))
    }

    async fn drain(stream: &mut TokenStream) -> (Vec<String>, Option<EdgeLoopError>) {
        let mut tokens = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => tokens.push(event.text),
                Err(e) => return (tokens, Some(e)),
            }
        }
        (tokens, None)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_tokens_across_chunks() {
        let engine = stub_engine("stream").await;
        engine.ensure_running().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        let mut stream = engine.submit("count", 16).await.unwrap();
        assert_eq!(engine.state(), EngineState::Busy);
        assert!(matches!(
            engine.submit("again", 16).await,
            Err(EdgeLoopError::Busy(_))
        ));

        let (tokens, error) = drain(&mut stream).await;
        assert!(error.is_none());
        assert_eq!(tokens, vec!["one", " two", " three", " four", " five"]);
        assert_eq!(engine.state(), EngineState::Ready);

        engine.shutdown().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_max_tokens_cuts_stream() {
        let engine = stub_engine("budget").await;
        engine.ensure_running().await.unwrap();

        let mut stream = engine.submit("count", 3).await.unwrap();
        let (tokens, error) = drain(&mut stream).await;
        assert!(error.is_none());
        assert_eq!(tokens, vec!["one", " two", " three"]);
        assert_eq!(engine.state(), EngineState::Ready);

        // The engine takes the next submission
        let mut stream = engine.submit("count", 1).await.unwrap();
        assert_eq!(drain(&mut stream).await.0, vec!["one"]);
        engine.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_killed_process_is_crash_and_restart_recovers() {
        let engine = stub_engine("killed").await;
        engine.ensure_running().await.unwrap();

        let mut stream = engine.submit("hang", 16).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().text, "one");
        assert_eq!(stream.next().await.unwrap().unwrap().text, " two");

        let pid = engine
            .process
            .lock()
            .await
            .as_ref()
            .and_then(ManagedProcess::pid)
            .unwrap();
        let status = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let result = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .unwrap();
        assert!(matches!(result, Some(Err(EdgeLoopError::EngineCrashed(_)))));
        assert_eq!(engine.state(), EngineState::Crashed);
        assert!(engine.submit("count", 4).await.is_err());

        engine.restart().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        let mut stream = engine.submit("count", 2).await.unwrap();
        assert_eq!(drain(&mut stream).await.0, vec!["one", " two"]);
        engine.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_stream_is_crash() {
        let engine = stub_engine("broken").await;
        engine.ensure_running().await.unwrap();

        let mut stream = engine.submit("break", 16).await.unwrap();
        let (tokens, error) = drain(&mut stream).await;
        assert_eq!(tokens, vec!["one", " two"]);
        assert!(matches!(error, Some(EdgeLoopError::EngineCrashed(_))));
        assert_eq!(engine.state(), EngineState::Crashed);
        engine.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_submit_leaves_engine_ready() {
        let engine = stub_engine("dropped").await;
        engine.ensure_running().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(100), engine.submit("slow", 4)).await;
        assert!(pending.is_err());
        assert_eq!(engine.state(), EngineState::Ready);
        engine.shutdown().await.unwrap();
    }
}
