//! Tracing layer for worker processes.
//!
//! Ships tracing events over IPC to the bridge as `log` messages, preserving
//! target and level. Stdout carries the protocol, so a subprocess worker cannot
//! simply print its diagnostics.

use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};

use crate::ipc::protocol::{LogLevel, WorkerResponse};

/// Events from the framing code itself are never shipped; encoding them would
/// produce more frames.
const SUPPRESSED_TARGET: &str = "codec_bridge::ipc";

pub struct WorkerTracingLayer {
    tx: mpsc::Sender<WorkerResponse>,
}

impl WorkerTracingLayer {
    pub fn new(tx: mpsc::Sender<WorkerResponse>) -> Self {
        Self { tx }
    }
}

impl<S> Layer<S> for WorkerTracingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(SUPPRESSED_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() {
            return;
        }

        // Dropped when the bridge is not keeping up.
        let _ = self.tx.try_send(WorkerResponse::Log {
            level: LogLevel::from(metadata.level()),
            target: Some(target.to_string()),
            message: visitor.message,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.len() >= 2 && self.message.starts_with('"') && self.message.ends_with('"')
            {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
