//! AsyncCodecBridge - request/response handshake with an out-of-process codec.
//!
//! A bridge owns at most one worker and at most one in-flight job. The worker
//! is spawned lazily on the first submit, loads its codec module once, and
//! serves jobs until it crashes, times out, idles out or the bridge shuts down.
//!
//! ```text
//!   Unloaded ──submit──▶ Loading ──ready──▶ Ready ◀──result/error/timeout── Busy
//!      ▲                    │                 │ └────────────submit──────────▶│
//!      │              load error/crash        │                               │
//!      │                    ▼                 │                             crash
//!      └──shutdown──── Failed ◀───────────────┴───────────────────────────────┘
//! ```

mod event_loop;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::ipc::protocol::RequestId;
use crate::options::{CodecOptions, ProcessedBytes};
use crate::spawner::WorkerSpawner;

use event_loop::{Command, EventLoop, JobRequest};
pub use state::{BridgeSnapshot, BridgeState};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 500 * 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_COMMAND_BUFFER: usize = 16;

pub const JOB_TIMEOUT_ENV: &str = "CODEC_BRIDGE_JOB_TIMEOUT_SECS";
pub const LOAD_TIMEOUT_ENV: &str = "CODEC_BRIDGE_LOAD_TIMEOUT_SECS";
pub const IDLE_TIMEOUT_ENV: &str = "CODEC_BRIDGE_IDLE_TIMEOUT_SECS";
pub const MAX_OUTPUT_BYTES_ENV: &str = "CODEC_BRIDGE_MAX_OUTPUT_BYTES";

/// Configuration for a bridge.
#[derive(Clone)]
pub struct BridgeConfig {
    pub(crate) spawner: Arc<dyn WorkerSpawner>,
    pub(crate) job_timeout: Duration,
    pub(crate) load_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_output_bytes: usize,
    /// `None` leaves only the wire frame limit.
    pub(crate) max_input_bytes: Option<usize>,
    pub(crate) shutdown_grace: Duration,
    pub(crate) command_buffer: usize,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("job_timeout", &self.job_timeout)
            .field("load_timeout", &self.load_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_output_bytes", &self.max_output_bytes)
            .field("max_input_bytes", &self.max_input_bytes)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("command_buffer", &self.command_buffer)
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn new(spawner: impl WorkerSpawner + 'static) -> Self {
        Self::with_spawner(Arc::new(spawner))
    }

    pub fn with_spawner(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            idle_timeout: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_input_bytes: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }

    /// Defaults overridden by `CODEC_BRIDGE_*` environment variables.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env(spawner: impl WorkerSpawner + 'static) -> Self {
        Self::new(spawner).apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(secs) = parse_override::<u64>(JOB_TIMEOUT_ENV, &lookup) {
            self.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_override::<u64>(LOAD_TIMEOUT_ENV, &lookup) {
            self.load_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_override::<u64>(IDLE_TIMEOUT_ENV, &lookup) {
            // 0 disables
            self.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(bytes) = parse_override::<usize>(MAX_OUTPUT_BYTES_ENV, &lookup) {
            self.max_output_bytes = bytes;
        }
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Shut the worker down after it has been idle this long.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Jobs whose input cannot be framed under this cap reject with
    /// [`BridgeError::InvalidOptions`] and never reach the worker.
    pub fn with_max_input_bytes(mut self, bytes: usize) -> Self {
        self.max_input_bytes = Some(bytes);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }

    pub fn job_timeout(&self) -> Duration {
        self.job_timeout
    }

    pub fn load_timeout(&self) -> Duration {
        self.load_timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

fn parse_override<T: std::str::FromStr>(
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}

/// Per-call overrides for [`AsyncCodecBridge::submit_with`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Replaces the configured job timeout for this call.
    pub timeout: Option<Duration>,
    /// Cancelling settles the call with [`BridgeError::Cancelled`].
    pub cancel: Option<CancellationToken>,
}

impl SubmitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Handle to a bridge. Cheap to clone; all clones share one worker.
///
/// Dropping the last handle stops the bridge, rejecting a pending job with
/// [`BridgeError::Shutdown`] and terminating the worker.
#[derive(Clone)]
pub struct AsyncCodecBridge {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<BridgeSnapshot>,
}

impl AsyncCodecBridge {
    /// Start a bridge. No worker is spawned until the first submit.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: BridgeConfig) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer);
        let (snapshot_tx, snapshot) = watch::channel(BridgeSnapshot::default());
        tracing::debug!(?config, "Starting codec bridge");
        tokio::spawn(EventLoop::new(config, snapshot_tx).run(command_rx));
        Self { commands, snapshot }
    }

    /// Process `input` with the worker's codec.
    pub async fn submit(
        &self,
        input: Bytes,
        options: CodecOptions,
    ) -> Result<ProcessedBytes, BridgeError> {
        self.submit_with(input, options, SubmitOptions::default())
            .await
    }

    /// Like [`submit`](Self::submit), with a timeout override and a cancellation token.
    ///
    /// Dropping the returned future abandons the job the same way cancelling does.
    pub async fn submit_with(
        &self,
        input: Bytes,
        options: CodecOptions,
        submit: SubmitOptions,
    ) -> Result<ProcessedBytes, BridgeError> {
        options.validate()?;

        let cancel = submit.cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let (reply, reply_rx) = oneshot::channel();
        let job = JobRequest {
            request_id: RequestId::new(),
            input,
            options,
            timeout: submit.timeout,
            reply,
        };
        self.commands
            .send(Command::Submit(job))
            .await
            .map_err(|_| BridgeError::Shutdown)?;

        tokio::select! {
            biased;

            result = reply_rx => result.unwrap_or(Err(BridgeError::Shutdown)),
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        }
    }

    /// Terminate the worker and reject any pending job with `Shutdown`.
    ///
    /// Idempotent. The bridge remains usable; the next submit spawns a fresh worker.
    pub async fn shutdown(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn state(&self) -> BridgeState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the bridge reaches `state`.
    pub async fn wait_for_state(&self, state: BridgeState) -> Result<(), BridgeError> {
        let mut rx = self.snapshot.clone();
        rx.wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::Shutdown)
    }
}
