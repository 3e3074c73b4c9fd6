//! Worker agent client for communication from the coordinator to workers
//!
//! Each worker node runs an agent that supervises its engine worker process.
//! The coordinator polls `/status` for health and asks agents to `/start` or
//! `/restart` their process.

use crate::registry::Node;
use async_trait::async_trait;
use edgeloop_common::error::{EdgeLoopError, Result};
use edgeloop_proto::{WorkerCommandReply, WorkerRestartResult, WorkerStatusReport};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{info, warn};

/// Control surface of the worker agents
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn status(&self, node: &Node) -> Result<WorkerStatusReport>;

    async fn start(&self, node: &Node) -> Result<WorkerCommandReply>;

    async fn restart(&self, node: &Node) -> Result<WorkerCommandReply>;
}

/// HTTP client for worker agents
#[derive(Debug, Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    command_timeout: Duration,
}

impl WorkerClient {
    /// Create a client. `status_timeout` bounds health polls; start and
    /// restart commands get twice as long.
    pub fn new(status_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(status_timeout)
            .build()
            .map_err(|e| EdgeLoopError::http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            command_timeout: status_timeout * 2,
        })
    }

    fn url(node: &Node, path: &str) -> String {
        format!("{}{}", node.address.trim_end_matches('/'), path)
    }

    async fn decode<T: DeserializeOwned>(node: &Node, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(EdgeLoopError::node_unreachable(
                node.id,
                format!("HTTP {}", status.as_u16()),
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| EdgeLoopError::node_unreachable(node.id, format!("bad response: {}", e)))
    }

    async fn command(&self, node: &Node, path: &str) -> Result<WorkerCommandReply> {
        let response = self
            .http
            .post(Self::url(node, path))
            .timeout(self.command_timeout)
            .send()
            .await
            .map_err(|e| EdgeLoopError::node_unreachable(node.id, e.to_string()))?;
        Self::decode(node, response).await
    }
}

#[async_trait]
impl WorkerControl for WorkerClient {
    async fn status(&self, node: &Node) -> Result<WorkerStatusReport> {
        let response = self
            .http
            .get(Self::url(node, "/status"))
            .send()
            .await
            .map_err(|e| EdgeLoopError::node_unreachable(node.id, e.to_string()))?;
        Self::decode(node, response).await
    }

    async fn start(&self, node: &Node) -> Result<WorkerCommandReply> {
        self.command(node, "/start").await
    }

    async fn restart(&self, node: &Node) -> Result<WorkerCommandReply> {
        self.command(node, "/restart").await
    }
}

/// Ask every unavailable worker to start its engine process.
///
/// Failures are logged and otherwise ignored; the engine starts with
/// whatever workers answer.
pub async fn start_unavailable(control: &dyn WorkerControl, workers: &[Node]) {
    let pending: Vec<&Node> = workers.iter().filter(|n| !n.is_available()).collect();
    let replies = join_all(pending.iter().map(|node| control.start(node))).await;

    for (node, reply) in pending.iter().zip(replies) {
        match reply {
            Ok(reply) => info!("Worker {} start: {}", node.id, reply.status),
            Err(e) => warn!("Failed to start worker {}: {}", node.id, e),
        }
    }
}

/// Ask every worker to restart its engine process
pub async fn restart_all(control: &dyn WorkerControl, workers: &[Node]) -> Vec<WorkerRestartResult> {
    let replies = join_all(workers.iter().map(|node| control.restart(node))).await;

    workers
        .iter()
        .zip(replies)
        .map(|(node, reply)| match reply {
            Ok(_) => WorkerRestartResult {
                worker_id: node.id,
                success: true,
                error: None,
            },
            Err(e) => {
                warn!("Failed to restart worker {}: {}", node.id, e);
                WorkerRestartResult {
                    worker_id: node.id,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect()
}
