//! EdgeLoop Coordinator - Main Entry Point
//!
//! Loads the topology, starts the metrics sampler and health monitor, warms
//! up the inference engine and serves the HTTP API until shutdown.

use anyhow::Context;
use edgeloop_common::{shutdown_signal, EdgeLoopConfig};
use edgeloop_coordinator::api::{self, AppState};
use edgeloop_coordinator::{
    engine, probe, Coordinator, HealthMonitor, LatencySimulator, MetricsSampler, NodeRegistry,
    WorkerClient, WorkerControl,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("EDGELOOP_CONFIG")
        .unwrap_or_else(|_| "configs/coordinator.yaml".to_string());
    let config = EdgeLoopConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;

    // Initialize logging
    let level = config.log_level();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "edgeloop_coordinator={level},edgeloop_common={level},tower_http=info,axum=info"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting EdgeLoop Coordinator");
    info!(
        "Coordinator configuration loaded: mode={}, bind={}:{}",
        config.mode, config.bind_address, config.port
    );

    let coordinator_config = config.coordinator()?;
    let engine_config = config.engine()?;

    let registry = NodeRegistry::from_config(coordinator_config, engine_config);
    info!(
        "Topology: {} nodes, model {}",
        registry.nodes().len(),
        engine_config.model_identifier()
    );

    let workers: Arc<dyn WorkerControl> =
        Arc::new(WorkerClient::new(coordinator_config.health_check_timeout())?);
    let engine = engine::from_config(
        engine_config,
        &coordinator_config.session,
        registry.clone(),
        workers.clone(),
    );
    let latency = Arc::new(LatencySimulator::new(&coordinator_config.latency)?);
    let coordinator = Arc::new(Coordinator::new(engine.clone(), latency, registry.clone()));

    // Background loops
    let sampler = Arc::new(MetricsSampler::new(
        registry.clone(),
        probe::from_source(coordinator_config.sampler.source),
        coordinator_config.sampler.clone(),
    ))
    .start();
    let health = Arc::new(HealthMonitor::new(
        registry.clone(),
        workers.clone(),
        engine.clone(),
        coordinator_config,
    ))
    .start();

    // Warm up
    if let Err(e) = engine.ensure_running().await {
        warn!("Engine warm-up failed, will retry on first request: {}", e);
    }

    let state = AppState {
        coordinator: coordinator.clone(),
        workers,
        metrics_enabled: config
            .observability
            .as_ref()
            .map_or(true, |o| o.enable_metrics),
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("EdgeLoop Coordinator listening on {}", addr);

    // Open SSE streams hold the server open until their session ends
    let draining = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.abort_active();
        })
        .await?;

    sampler.abort();
    health.abort();
    coordinator.shutdown().await?;

    info!("EdgeLoop Coordinator shutdown complete");
    Ok(())
}
