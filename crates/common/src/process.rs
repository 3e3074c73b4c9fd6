//! Supervised child processes
//!
//! Both the coordinator's engine adapter and the worker agent run the
//! inference engine as a child process. `ManagedProcess` spawns it with its
//! output forwarded to tracing, publishes its exit on a watch channel, and
//! stops it with SIGTERM followed by SIGKILL once the grace period runs out.

use crate::error::{EdgeLoopError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How long to wait for the OS to reap a killed process
const KILL_WAIT: Duration = Duration::from_secs(5);

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Name used in logs
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Full command line, for logs
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,

    /// Whether we asked the process to stop
    pub requested: bool,
}

impl ProcessExit {
    fn unknown() -> Self {
        Self {
            code: None,
            requested: false,
        }
    }

    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A running (or finished) child process
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    started_at: Instant,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: Option<oneshot::Sender<()>>,
    stop_requested: Arc<AtomicBool>,
}

impl ManagedProcess {
    /// Spawn the process described by `spec`.
    ///
    /// Must be called inside a tokio runtime. Dropping the handle kills the
    /// process.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        info!("Starting {}: {}", spec.name, spec.command_line());
        let mut child = cmd.spawn().map_err(|e| {
            EdgeLoopError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to spawn {}: {}", spec.program.display(), e),
            ))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %name, "{}", line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process = %name, "{}", line);
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let stop_requested = Arc::new(AtomicBool::new(false));

        let requested = stop_requested.clone();
        let name = spec.name.clone();
        tokio::spawn(async move {
            // Resolves on an explicit kill and when the handle is dropped
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match status {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let requested = requested.load(Ordering::SeqCst);
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    requested,
                },
                Err(e) => {
                    warn!("Failed to wait on {}: {}", name, e);
                    ProcessExit {
                        code: None,
                        requested,
                    }
                }
            };

            if requested {
                info!("{} stopped ({})", name, exit.describe());
            } else {
                warn!("{} exited unexpectedly ({})", name, exit.describe());
            }
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Self {
            name: spec.name.clone(),
            pid,
            started_at: Instant::now(),
            exit_rx,
            kill_tx: Some(kill_tx),
            stop_requested,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit status, once the process has ended
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Channel that turns `Some` when the process ends
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to end
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or_else(ProcessExit::unknown),
            Err(_) => ProcessExit::unknown(),
        };
        exit
    }

    /// Kill immediately
    pub fn kill(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// SIGTERM, then SIGKILL after `grace`
    pub async fn stop(&mut self, grace: Duration) -> Result<ProcessExit> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(exit) = self.exit_status() {
            return Ok(exit);
        }

        self.terminate();
        if let Ok(exit) = tokio::time::timeout(grace, self.wait()).await {
            return Ok(exit);
        }

        warn!("{} did not stop within {:?}, killing", self.name, grace);
        self.kill();
        tokio::time::timeout(KILL_WAIT, self.wait())
            .await
            .map_err(|_| EdgeLoopError::timeout(format!("{} could not be killed", self.name)))
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to {}: {}", self.name, e);
                    self.kill();
                }
            }
            None => self.kill(),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        self.kill();
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .finish()
    }
}
