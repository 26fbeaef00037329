//! IPC layer between a bridge and its codec worker.
//!
//! This module provides the wire protocol and codec for communication between
//! the bridge (parent) and a worker subprocess or task.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse, RequestId)
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
