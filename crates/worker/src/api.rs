//! HTTP surface of the worker agent

use crate::agent::WorkerAgent;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use edgeloop_common::error::Result;
use edgeloop_proto::{WorkerCommandReply, WorkerStatusReport};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

/// Build the worker agent router
pub fn router(agent: Arc<WorkerAgent>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}

async fn status(State(agent): State<Arc<WorkerAgent>>) -> Json<WorkerStatusReport> {
    Json(agent.status().await)
}

async fn start(State(agent): State<Arc<WorkerAgent>>) -> Response {
    command_response(&agent, agent.start().await)
}

async fn stop(State(agent): State<Arc<WorkerAgent>>) -> Response {
    command_response(&agent, agent.stop().await)
}

async fn restart(State(agent): State<Arc<WorkerAgent>>) -> Response {
    command_response(&agent, agent.restart().await)
}

fn command_response(agent: &WorkerAgent, result: Result<WorkerCommandReply>) -> Response {
    match result {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => {
            error!("Worker command failed: {}", e);
            let reply = WorkerCommandReply {
                worker_id: agent.worker_id(),
                status: "error".to_string(),
                message: Some(e.to_string()),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(reply)).into_response()
        }
    }
}
