//! codec-bridge: lifecycle and request/response bridge for out-of-process codec workers.

pub mod bridge;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod options;
pub mod registry;
pub mod spawner;
mod version;
pub mod worker;
mod worker_tracing_layer;

pub use bridge::{AsyncCodecBridge, BridgeConfig, BridgeSnapshot, BridgeState, SubmitOptions};
pub use error::BridgeError;
pub use ipc::protocol::{LogLevel, RequestId, WorkerRequest, WorkerResponse};
pub use logging::{init_tracing, init_worker_tracing};
pub use options::{
    CodecOptions, ImageMime, ImageQuality, PdfQualityProfile, ProcessedBytes,
};
pub use registry::{BridgeRegistry, RegistryError};
pub use spawner::{CommandSpawner, InProcessSpawner, WorkerSpawner};
pub use tokio_util::sync::CancellationToken;
pub use version::{CODEC_BRIDGE_VERSION, PROTOCOL_VERSION};
pub use worker::{CodecError, CodecHandler, JobLogger, WorkerConfig, run_worker, run_worker_stdio};
pub use worker_tracing_layer::WorkerTracingLayer;
