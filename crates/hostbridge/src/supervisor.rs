//! Worker subprocess lifecycle.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout/stderr piped
//! 2. Hand stdin to the relay's host→worker path, stdout to its worker→host task
//! 3. Drain stderr into the relay's log
//! 4. On shutdown: terminate, then join with a grace period before killing

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};

/// What to run as the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {0} not captured")]
    MissingPipe(&'static str),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Spawns the configured program directly.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// A running worker and the pipes not yet handed out.
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    pub fn spawn(spawner: &dyn WorkerSpawner, command: &WorkerCommand) -> Result<Self, SpawnError> {
        tracing::info!(program = %command.program.display(), args = ?command.args, "Spawning worker subprocess");
        let mut child = spawner.spawn(command)?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr_drain = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        tracing::debug!(pid = ?child.id(), "Worker started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr_drain,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Ask the worker to exit. Does not wait.
    pub fn terminate(&mut self) {
        // Closing stdin is the worker's own shutdown trigger.
        self.stdin.take();

        let Some(pid) = self.child.id() else {
            tracing::debug!("Worker already exited");
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            match i32::try_from(pid) {
                Ok(raw) => {
                    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                        tracing::warn!(pid, error = %e, "Failed to send SIGTERM to worker");
                    } else {
                        tracing::debug!(pid, "Sent SIGTERM to worker");
                    }
                }
                Err(_) => tracing::warn!(pid, "Worker pid out of range"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!(pid, error = %e, "Failed to kill worker");
            }
        }
    }

    /// Wait for the worker to exit, killing it if `grace` elapses first.
    pub async fn join(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "Worker did not exit in time, killing");
                self.child.kill().await?;
                self.child.wait().await?
            }
        };

        // A grandchild can hold stderr open after the worker itself is gone.
        if let Some(mut drain) = self.stderr_drain.take() {
            match tokio::time::timeout(grace, &mut drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Worker stderr drain task failed"),
                Err(_) => {
                    tracing::debug!("Worker stderr still open after exit, detaching");
                    drain.abort();
                }
            }
        }

        tracing::info!(%status, "Worker exited");
        Ok(status)
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new()));
    while let Some(line) = lines.next().await {
        match line {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let trimmed = text.trim_end();
                if !trimmed.is_empty() {
                    tracing::info!(target: "hostbridge::worker", "{}", trimmed);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
    tracing::trace!("Worker stderr closed");
}
