//! Engine worker supervision
//!
//! The agent owns at most one engine worker process and answers the
//! coordinator's status and lifecycle commands for it.

use edgeloop_common::config::WorkerConfig;
use edgeloop_common::error::Result;
use edgeloop_common::{ManagedProcess, ProcessSpec};
use edgeloop_proto::{WorkerCommandReply, WorkerStatusReport};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Supervises the engine worker process of one node
pub struct WorkerAgent {
    config: WorkerConfig,
    spec: ProcessSpec,
    process: Mutex<Option<ManagedProcess>>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig) -> Self {
        let spec = process_spec(&config);
        Self {
            config,
            spec,
            process: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> u32 {
        self.config.worker_id
    }

    /// Current state of the engine worker
    pub async fn status(&self) -> WorkerStatusReport {
        let process = self.process.lock().await;
        let running = process.as_ref().filter(|p| p.is_running());

        WorkerStatusReport {
            worker_id: self.config.worker_id,
            status: if running.is_some() { "online" } else { "offline" }.to_string(),
            is_available: running.is_some(),
            uptime_seconds: running.map_or(0.0, |p| p.uptime().as_secs_f64()),
        }
    }

    /// Start the engine worker unless it is already running
    pub async fn start(&self) -> Result<WorkerCommandReply> {
        let mut process = self.process.lock().await;
        if process.as_ref().is_some_and(ManagedProcess::is_running) {
            return Ok(self.reply("already_running"));
        }

        *process = Some(ManagedProcess::spawn(&self.spec)?);
        info!("Engine worker {} started", self.config.worker_id);
        Ok(self.reply("started"))
    }

    /// SIGTERM the engine worker, killing it after the grace period
    pub async fn stop(&self) -> Result<WorkerCommandReply> {
        let mut process = self.process.lock().await;
        let Some(mut running) = process.take() else {
            return Ok(self.reply("not_running"));
        };
        if !running.is_running() {
            let exit = running.exit_status().map(|e| e.describe());
            return Ok(WorkerCommandReply {
                message: exit,
                ..self.reply("not_running")
            });
        }

        let exit = running.stop(self.config.stop_grace()).await?;
        info!(
            "Engine worker {} stopped ({})",
            self.config.worker_id,
            exit.describe()
        );
        Ok(self.reply("stopped"))
    }

    /// Stop, then start again
    pub async fn restart(&self) -> Result<WorkerCommandReply> {
        if let Err(e) = self.stop().await {
            warn!("Stopping engine worker before restart failed: {}", e);
        }
        self.start().await
    }

    fn reply(&self, status: &str) -> WorkerCommandReply {
        WorkerCommandReply {
            worker_id: self.config.worker_id,
            status: status.to_string(),
            message: None,
        }
    }
}

/// `dllama worker --port P --nthreads N`
pub(crate) fn process_spec(config: &WorkerConfig) -> ProcessSpec {
    ProcessSpec::new(
        format!("engine-worker-{}", config.worker_id),
        config.binary.clone(),
    )
    .arg("worker")
    .args([
        "--port".to_string(),
        config.engine_port.to_string(),
        "--nthreads".to_string(),
        config.nthreads.to_string(),
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn config(binary: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: 2,
            binary: PathBuf::from(binary),
            engine_port: 9998,
            nthreads: 1,
            stop_grace_secs: 1,
            autostart: false,
        }
    }

    #[test]
    fn test_process_spec() {
        let spec = process_spec(&config("/opt/dllama"));
        assert_eq!(
            spec.command_line(),
            "/opt/dllama worker --port 9998 --nthreads 1"
        );
        assert_eq!(spec.name, "engine-worker-2");
    }

    #[tokio::test]
    async fn test_status_when_stopped() {
        let agent = WorkerAgent::new(config("/nonexistent/dllama"));
        let status = agent.status().await;
        assert_eq!(status.worker_id, 2);
        assert_eq!(status.status, "offline");
        assert!(!status.is_available);
        assert_eq!(status.uptime_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_start_missing_binary_fails() {
        let agent = WorkerAgent::new(config("/nonexistent/dllama"));
        assert!(agent.start().await.is_err());
        assert!(!agent.status().await.is_available);
        assert_eq!(agent.stop().await.unwrap().status, "not_running");
    }

    /// Script that ignores its arguments and stays up
    #[cfg(unix)]
    fn fake_engine(name: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("edgeloop-{}-{}", name, std::process::id()));
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lifecycle() {
        let agent = WorkerAgent::new(config(&fake_engine("lifecycle")));

        assert_eq!(agent.start().await.unwrap().status, "started");
        assert_eq!(agent.start().await.unwrap().status, "already_running");
        let status = agent.status().await;
        assert_eq!(status.status, "online");
        assert!(status.is_available);

        assert_eq!(agent.restart().await.unwrap().status, "started");
        assert!(agent.status().await.is_available);

        assert_eq!(agent.stop().await.unwrap().status, "stopped");
        assert_eq!(agent.stop().await.unwrap().status, "not_running");
        assert!(!agent.status().await.is_available);
    }

    // `sleep worker --port ...` exits at once with a usage error, which is
    // enough to exercise the lifecycle of a process that dies on its own.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_that_exits_reports_offline() {
        let agent = WorkerAgent::new(config("sleep"));
        assert_eq!(agent.start().await.unwrap().status, "started");

        for _ in 0..100 {
            if !agent.status().await.is_available {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(agent.status().await.status, "offline");

        // A dead process can be started again
        assert_eq!(agent.start().await.unwrap().status, "started");
        agent.stop().await.unwrap();
    }
}
