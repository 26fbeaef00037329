//! Worker spawn strategies.
//!
//! A spawner hands the bridge a read half, a write half and a handle used to
//! stop the worker. The bridge never looks inside the worker; it only talks
//! over the two halves.

use std::ffi::OsString;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::worker::{CodecHandler, WorkerConfig, run_worker};

/// Environment variable carrying the worker generation into subprocesses.
pub const GENERATION_ENV: &str = "CODEC_BRIDGE_WORKER_GENERATION";

const DEFAULT_PIPE_CAPACITY: usize = 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Channels to a freshly spawned worker.
pub struct WorkerChannels {
    /// Worker → bridge.
    pub reader: BoxedReader,
    /// Bridge → worker.
    pub writer: BoxedWriter,
    pub process: WorkerProcess,
}

/// What the bridge terminates when it is done with a worker.
pub enum WorkerProcess {
    Child(Child),
    Task(JoinHandle<io::Result<()>>),
    /// Lifetime owned by whoever holds the other end of the channels.
    Detached,
}

impl WorkerProcess {
    /// Wait up to `grace` for a voluntary exit, then force it.
    pub async fn terminate(self, grace: Duration) {
        match self {
            Self::Child(mut child) => match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "Worker process exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker process"),
                Err(_) => {
                    tracing::warn!(?grace, "Worker process did not exit in time, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill worker process");
                    }
                }
            },
            Self::Task(mut handle) => match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(Ok(()))) => tracing::debug!("Worker task exited"),
                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Worker task exited with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Worker task panicked"),
                Err(_) => {
                    tracing::warn!(?grace, "Worker task did not exit in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            },
            Self::Detached => {}
        }
    }

    /// Stop the worker immediately.
    pub async fn kill(self) {
        match self {
            Self::Child(mut child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker process");
                }
            }
            Self::Task(handle) => {
                handle.abort();
                // Resolves once the worker future, and the job tasks it owns, are dropped.
                let _ = handle.await;
            }
            Self::Detached => {}
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// `generation` increases by one for every worker a bridge starts.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, generation: u64) -> Result<WorkerChannels, SpawnError>;
}

/// Runs a worker executable speaking the protocol on stdin/stdout.
///
/// Stderr is inherited so worker diagnostics reach the host's log stream.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, generation: u64) -> Result<WorkerChannels, SpawnError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(GENERATION_ENV, generation.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        tracing::debug!(generation, pid = child.id(), "Spawned worker process");

        Ok(WorkerChannels {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: WorkerProcess::Child(child),
        })
    }
}

type HandlerFactory = dyn Fn() -> Arc<dyn CodecHandler> + Send + Sync;

/// Runs the worker runtime on a tokio task connected by an in-memory pipe.
///
/// Each spawn builds a fresh handler, so a respawned worker loads its codec
/// module from scratch exactly as a new process would.
pub struct InProcessSpawner {
    factory: Box<HandlerFactory>,
    pipe_capacity: usize,
}

impl InProcessSpawner {
    pub fn new<H, F>(factory: F) -> Self
    where
        H: CodecHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(move || Arc::new(factory()) as Arc<dyn CodecHandler>),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    pub fn with_pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes;
        self
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&self, generation: u64) -> Result<WorkerChannels, SpawnError> {
        let (bridge_side, worker_side) = tokio::io::duplex(self.pipe_capacity);
        let handler = (self.factory)();

        let (worker_read, worker_write) = tokio::io::split(worker_side);
        let handle = tokio::spawn(async move {
            run_worker(handler, worker_read, worker_write, WorkerConfig::default()).await
        });
        tracing::debug!(generation, "Spawned in-process worker");

        let (reader, writer) = tokio::io::split(bridge_side);
        Ok(WorkerChannels {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: WorkerProcess::Task(handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spawner_builder() {
        let spawner = CommandSpawner::new("codec-worker")
            .arg("--profile")
            .args(["ebook", "--quiet"])
            .env("RUST_LOG", "debug");
        assert_eq!(spawner.program, OsString::from("codec-worker"));
        assert_eq!(spawner.args.len(), 3);
        assert_eq!(spawner.envs.len(), 1);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/codec-bridge-worker");
        let err = spawner.spawn(1).err().expect("spawn should fail");
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[tokio::test]
    async fn detached_terminate_is_noop() {
        WorkerProcess::Detached
            .terminate(Duration::from_millis(10))
            .await;
        WorkerProcess::Detached.kill().await;
    }

    #[tokio::test]
    async fn stuck_task_is_aborted_after_grace() {
        let handle = tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        WorkerProcess::Task(handle)
            .terminate(Duration::from_millis(10))
            .await;
    }
}
