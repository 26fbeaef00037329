//! Error taxonomy surfaced to bridge callers.

use std::time::Duration;

/// Why a submitted job did not produce output.
///
/// Every variant except [`BridgeError::InvalidOptions`] is delivered through
/// the future returned by `submit`; the bridge itself survives all of them and
/// accepts a new job immediately afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The worker process or task could not be started.
    #[error("failed to start worker: {0}")]
    WorkerStartup(String),

    /// The codec module inside the worker failed to load (or never reported ready).
    #[error("codec module failed to load: {0}")]
    ModuleLoad(String),

    /// The codec rejected the input.
    #[error("processing failed: {0}")]
    Processing(String),

    /// The worker sent something that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The worker exited or its channel broke while loading or processing.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// Another job is still in flight on this bridge.
    #[error("another job is already in flight")]
    ConcurrentJobRejected,

    /// Output exceeded the configured cap. `size` is the number of bytes
    /// observed when the cap tripped (the wire frame if it tripped before decoding).
    #[error("output of {size} bytes exceeds limit of {limit} bytes")]
    OutputTooLarge { size: u64, limit: u64 },

    #[error("job was cancelled")]
    Cancelled,

    #[error("bridge shut down")]
    Shutdown,

    /// Programmer error: the options can never be processed.
    #[error("invalid codec options: {0}")]
    InvalidOptions(String),
}

impl BridgeError {
    /// Short stable name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkerStartup(_) => "worker_startup",
            Self::ModuleLoad(_) => "module_load",
            Self::Processing(_) => "processing",
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::WorkerCrash(_) => "worker_crash",
            Self::ConcurrentJobRejected => "concurrent_job_rejected",
            Self::OutputTooLarge { .. } => "output_too_large",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
            Self::InvalidOptions(_) => "invalid_options",
        }
    }

    /// Whether submitting the same input again can succeed.
    ///
    /// Processing failures and oversized outputs are properties of the input;
    /// everything else is a property of the worker or of timing.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Processing(_) | Self::OutputTooLarge { .. } | Self::InvalidOptions(_)
        )
    }
}
