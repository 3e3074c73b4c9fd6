//! HTTP API of the coordinator

use crate::coordinator::Coordinator;
use crate::engine::EngineState;
use crate::worker_client::{restart_all, WorkerControl};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use edgeloop_common::error::EdgeLoopError;
use edgeloop_common::METRICS;
use edgeloop_proto::{
    ErrorBody, GenerateRequest, NodeStatusView, StreamEvent, SystemStatusView, WorkerRestartResult,
    DONE_SENTINEL,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, instrument};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub workers: Arc<dyn WorkerControl>,
    pub metrics_enabled: bool,
}

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError(EdgeLoopError);

impl From<EdgeLoopError> for ApiError {
    fn from(err: EdgeLoopError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EdgeLoopError::Busy(_) => StatusCode::CONFLICT,
            EdgeLoopError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EdgeLoopError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            other => {
                error!(error = %other, "Internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorBody {
            success: false,
            kind: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Build the coordinator router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/generate", post(generate))
        .route("/generate/abort", post(abort))
        .route("/nodes/status", get(nodes_status))
        .route("/system/status", get(system_status))
        .route("/workers/restart", post(restart_workers))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn banner() -> impl IntoResponse {
    Json(json!({
        "service": "edgeloop-coordinator",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.coordinator.engine().state() {
        EngineState::Ready | EngineState::Busy => (StatusCode::OK, "ready".to_string()),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    if !state.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.gather(),
    )
        .into_response()
}

/// Stream a generation as server-sent events
#[instrument(skip_all)]
async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let handle = state.coordinator.start(request)?;
    Ok(Sse::new(event_stream(handle.into_stream())).keep_alive(KeepAlive::default()))
}

/// One `data:` frame per event, then `[DONE]` exactly once
fn event_stream<S>(events: S) -> impl Stream<Item = Result<Event, Infallible>>
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    events
        .map(|event| {
            Ok(Event::default().json_data(&event).unwrap_or_else(|e| {
                error!("Failed to encode stream event: {}", e);
                Event::default().comment("encoding error")
            }))
        })
        .chain(stream::once(async {
            Ok(Event::default().data(DONE_SENTINEL))
        }))
}

async fn abort(State(state): State<AppState>) -> impl IntoResponse {
    let aborted = state.coordinator.abort_active();
    Json(json!({
        "success": true,
        "aborted": aborted.is_some(),
        "request_id": aborted,
    }))
}

async fn nodes_status(State(state): State<AppState>) -> Json<Vec<NodeStatusView>> {
    Json(state.coordinator.registry().node_views())
}

async fn system_status(State(state): State<AppState>) -> Json<SystemStatusView> {
    let engine_state = state.coordinator.engine().state().to_string();
    Json(state.coordinator.registry().system_view(&engine_state))
}

async fn restart_workers(State(state): State<AppState>) -> Json<Vec<WorkerRestartResult>> {
    let workers = state.coordinator.registry().workers();
    Json(restart_all(state.workers.as_ref(), &workers).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InferenceEngine, ScriptedEngine};
    use crate::latency::LatencySimulator;
    use crate::registry::tests::topology;
    use crate::registry::NodeRegistry;
    use crate::worker_client::tests::FakeWorkers;
    use edgeloop_common::config::LatencyConfig;
    use std::time::Duration;

    fn app_state(script: &str, token_delay: Duration) -> AppState {
        let registry = NodeRegistry::new(&topology(2), 16, "model", "tokenizer");
        let latency = LatencyConfig {
            min_secs: 0.0,
            max_secs: 0.0,
            links: Vec::new(),
        };
        let engine: Arc<dyn InferenceEngine> =
            Arc::new(ScriptedEngine::new(Some(script.to_string()), token_delay));
        let coordinator = Coordinator::new(
            engine,
            Arc::new(LatencySimulator::with_seed(&latency, 1).unwrap()),
            registry,
        );
        AppState {
            coordinator: Arc::new(coordinator),
            workers: Arc::new(FakeWorkers::default()),
            metrics_enabled: true,
        }
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_generate_streams_sse() {
        let state = app_state("one two three", Duration::ZERO);
        let request = GenerateRequest {
            prompt: "count".to_string(),
            max_tokens: 10,
        };
        let response = generate(State(state), Json(request)).await.unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        let data: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 5);
        assert!(data[0].contains(r#""type":"token""#));
        assert!(data[3].contains(r#""type":"summary""#));
        assert_eq!(data[4], DONE_SENTINEL);
        assert_eq!(body.matches(DONE_SENTINEL).count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_max_tokens_is_accepted() {
        let state = app_state("one two", Duration::ZERO);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let response = reqwest::Client::new()
            .post(format!("http://{}/generate", addr))
            .header(header::CONTENT_TYPE, "application/json")
            .body(r#"{"prompt":"x","max_tokens":99999999999999999999999}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let body = response.text().await.unwrap();
        assert!(body.contains(r#""type":"summary""#));
        assert!(body.contains(DONE_SENTINEL));
    }

    #[tokio::test]
    async fn test_busy_is_conflict() {
        let state = app_state("slow", Duration::from_secs(60));
        let first = GenerateRequest {
            prompt: "a".to_string(),
            max_tokens: 1,
        };
        let _stream = generate(State(state.clone()), Json(first)).await.unwrap();

        let second = GenerateRequest {
            prompt: "b".to_string(),
            max_tokens: 1,
        };
        let response = match generate(State(state), Json(second)).await {
            Ok(_) => panic!("second session accepted"),
            Err(e) => e.into_response(),
        };
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_text(response).await.contains(r#""kind":"busy""#));
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let state = app_state("x", Duration::ZERO);
        let Json(nodes) = nodes_status(State(state.clone())).await;
        assert_eq!(nodes.len(), 3);

        let Json(system) = system_status(State(state.clone())).await;
        assert_eq!(system.total_nodes, 3);
        assert_eq!(system.engine_state, "stopped");
        assert_eq!(system.model_identifier, "model");

        let response = ready(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_restart_workers() {
        let state = app_state("x", Duration::ZERO);
        let Json(results) = restart_workers(State(state)).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = app_state("x", Duration::ZERO);
        let response = metrics(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let disabled = AppState {
            metrics_enabled: false,
            ..state
        };
        assert_eq!(metrics(State(disabled)).await.status(), StatusCode::NOT_FOUND);
    }
}
