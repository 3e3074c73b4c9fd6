//! EdgeLoop Worker - Main Entry Point
//!
//! Starts the engine worker process and serves the agent API the coordinator
//! uses to check on it and restart it.

use anyhow::Context;
use edgeloop_common::{shutdown_signal, EdgeLoopConfig};
use edgeloop_worker::{api, WorkerAgent};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path =
        std::env::var("EDGELOOP_CONFIG").unwrap_or_else(|_| "configs/worker.yaml".to_string());
    let config = EdgeLoopConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;

    // Initialize logging
    let level = config.log_level();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("edgeloop_worker={level},edgeloop_common={level},tower_http=info,axum=info")
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting EdgeLoop Worker");
    info!(
        "Worker configuration loaded: mode={}, bind={}:{}",
        config.mode, config.bind_address, config.port
    );

    let worker_config = config.worker()?.clone();
    let autostart = worker_config.autostart;
    let agent = Arc::new(WorkerAgent::new(worker_config));

    if autostart {
        if let Err(e) = agent.start().await {
            error!("Failed to start engine worker: {}", e);
        }
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("EdgeLoop Worker {} listening on {}", agent.worker_id(), addr);

    axum::serve(listener, api::router(agent.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    agent.stop().await?;

    info!("EdgeLoop Worker shutdown complete");
    Ok(())
}
