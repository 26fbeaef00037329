//! The bridge actor.
//!
//! One task owns the worker connection, the pending job and the readiness
//! state. Callers reach it through the command channel; worker output reaches
//! it through a reader task tagged with the worker's generation so frames from
//! a retired worker can never settle a newer job. Requests go out through a
//! writer task of the same generation, so the actor never waits on a worker
//! that has stopped reading.

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::BridgeConfig;
use super::state::{BridgeSnapshot, BridgeState};
use crate::error::BridgeError;
use crate::ipc::codec::{
    JsonCodec, MAX_WIRE_FRAME_LENGTH, MalformedFrame, frame_too_large, payload_frame_limit,
};
use crate::ipc::protocol::{LogLevel, RequestId, WorkerRequest, WorkerResponse};
use crate::options::{CodecOptions, ProcessedBytes};
use crate::spawner::{BoxedReader, BoxedWriter, WorkerProcess};
use crate::version::PROTOCOL_VERSION;

pub(crate) type JobReply = oneshot::Sender<Result<ProcessedBytes, BridgeError>>;

pub(crate) enum Command {
    Submit(JobRequest),
    Shutdown { done: oneshot::Sender<()> },
}

pub(crate) struct JobRequest {
    pub request_id: RequestId,
    pub input: Bytes,
    pub options: CodecOptions,
    pub timeout: Option<Duration>,
    pub reply: JobReply,
}

/// The single job a bridge may have outstanding.
///
/// `settle` consumes the job, so it can be answered at most once; every path
/// that removes it from the loop settles it.
struct PendingJob {
    request_id: RequestId,
    reply: JobReply,
    submitted_at: Instant,
    timeout: Duration,
    dispatched_at: Option<Instant>,
    /// Taken when the job is written to the worker.
    payload: Option<(Bytes, CodecOptions)>,
}

impl PendingJob {
    fn deadline(&self) -> Option<Instant> {
        self.dispatched_at.map(|at| at + self.timeout)
    }

    fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }

    fn settle(self, result: Result<ProcessedBytes, BridgeError>) {
        let request_id = self.request_id;
        let elapsed_ms = self.submitted_at.elapsed().as_millis() as u64;
        match &result {
            Ok(output) => tracing::debug!(
                target: "codec_bridge::job",
                %request_id,
                output_bytes = output.len(),
                elapsed_ms,
                "Job succeeded"
            ),
            Err(e) => tracing::debug!(
                target: "codec_bridge::job",
                %request_id,
                error_kind = e.kind(),
                error = %e,
                elapsed_ms,
                "Job failed"
            ),
        }
        if self.reply.send(result).is_err() {
            tracing::trace!(target: "codec_bridge::job", %request_id, "Caller gone before settlement");
        }
    }
}

struct WorkerConn {
    generation: u64,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    writer_task: JoinHandle<()>,
    process: WorkerProcess,
    reader_task: JoinHandle<()>,
    /// Job handed to the writer whose frame is not fully written yet.
    writing: Option<RequestId>,
    /// A job timed out on this worker; replace it before the next job.
    suspect: bool,
    /// Jobs the bridge gave up on that the worker has not answered yet.
    abandoned: HashSet<RequestId>,
}

impl WorkerConn {
    fn needs_recycle(&self) -> bool {
        self.suspect || !self.abandoned.is_empty()
    }

    fn send(&self, request: WorkerRequest) {
        if self.requests.send(request).is_err() {
            tracing::debug!(generation = self.generation, "Worker writer gone, request dropped");
        }
    }

    fn send_job(&mut self, request_id: RequestId, input: Bytes, options: CodecOptions) {
        self.writing = Some(request_id);
        self.send(WorkerRequest::Job {
            request_id,
            input,
            options,
        });
    }

    async fn kill(self) {
        let Self {
            generation,
            requests,
            writer_task,
            process,
            reader_task,
            ..
        } = self;
        reader_task.abort();
        writer_task.abort();
        drop(requests);
        process.kill().await;
        tracing::debug!(generation, "Worker killed");
    }

    async fn terminate(self, grace: Duration) {
        // A half-written job frame cannot be followed by a readable shutdown.
        if let Some(request_id) = self.writing {
            tracing::debug!(generation = self.generation, %request_id, "Job still being written, killing worker");
            return self.kill().await;
        }
        let Self {
            generation,
            requests,
            mut writer_task,
            process,
            reader_task,
            ..
        } = self;
        let _ = requests.send(WorkerRequest::Shutdown);
        // Closing the request stream is the exit signal for workers that missed Shutdown.
        drop(requests);
        if tokio::time::timeout(grace, &mut writer_task).await.is_err() {
            tracing::debug!(generation, "Timed out sending shutdown");
            writer_task.abort();
        }
        process.terminate(grace).await;
        reader_task.abort();
        tracing::debug!(generation, "Worker terminated");
    }
}

enum WorkerEventKind {
    Message(WorkerResponse),
    Malformed(MalformedFrame),
    Failed(io::Error),
    Closed,
    /// A job frame reached the worker's input in full.
    Written { request_id: RequestId },
    /// A job could not be encoded; nothing was written.
    Unencodable { request_id: RequestId, error: io::Error },
}

struct WorkerEvent {
    generation: u64,
    kind: WorkerEventKind,
}

fn spawn_reader(
    generation: u64,
    reader: BoxedReader,
    max_frame_length: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(
            reader,
            JsonCodec::<WorkerResponse>::with_max_frame_length(max_frame_length),
        );
        loop {
            let (kind, last) = match frames.next().await {
                Some(Ok(Ok(msg))) => (WorkerEventKind::Message(msg), false),
                Some(Ok(Err(malformed))) => (WorkerEventKind::Malformed(malformed), false),
                Some(Err(e)) => (WorkerEventKind::Failed(e), true),
                None => (WorkerEventKind::Closed, true),
            };
            if events.send(WorkerEvent { generation, kind }).is_err() || last {
                break;
            }
        }
        tracing::trace!(generation, "Worker reader exiting");
    })
}

fn spawn_writer(
    generation: u64,
    writer: BoxedWriter,
    max_frame_length: usize,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames = FramedWrite::new(
            writer,
            JsonCodec::<WorkerRequest>::with_max_frame_length(max_frame_length),
        );
        let report = |kind| {
            let _ = events.send(WorkerEvent { generation, kind });
        };
        while let Some(request) = requests.recv().await {
            let job = match &request {
                WorkerRequest::Job { request_id, .. } => Some(*request_id),
                _ => None,
            };
            // The buffer is empty between requests, so `feed` fails only on encoding.
            if let Err(error) = frames.feed(request).await {
                match job {
                    Some(request_id) => {
                        report(WorkerEventKind::Unencodable { request_id, error });
                        continue;
                    }
                    None => {
                        report(WorkerEventKind::Failed(error));
                        break;
                    }
                }
            }
            if let Err(e) = frames.flush().await {
                report(WorkerEventKind::Failed(e));
                break;
            }
            if let Some(request_id) = job {
                report(WorkerEventKind::Written { request_id });
            }
        }
        let _ = frames.close().await;
        tracing::trace!(generation, "Worker writer exiting");
    })
}

enum Retire {
    Kill,
    Graceful,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves when the caller of the pending job stops listening.
async fn caller_gone(pending: &mut Option<PendingJob>) {
    match pending {
        Some(job) => job.reply.closed().await,
        None => std::future::pending().await,
    }
}

fn emit_worker_log(level: LogLevel, source: Option<&str>, message: &str) {
    let source = source.unwrap_or("worker");
    match level {
        LogLevel::Error => tracing::error!(target: "codec_bridge::worker", source, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "codec_bridge::worker", source, "{}", message),
        LogLevel::Info => tracing::info!(target: "codec_bridge::worker", source, "{}", message),
        LogLevel::Debug => tracing::debug!(target: "codec_bridge::worker", source, "{}", message),
        LogLevel::Trace => tracing::trace!(target: "codec_bridge::worker", source, "{}", message),
    }
}

pub(crate) struct EventLoop {
    config: BridgeConfig,
    state: BridgeState,
    generation: u64,
    module_loads: u64,
    jobs_completed: u64,
    ready_since: Option<DateTime<Utc>>,
    worker: Option<WorkerConn>,
    pending: Option<PendingJob>,
    load_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    snapshot_tx: watch::Sender<BridgeSnapshot>,
}

impl EventLoop {
    pub(crate) fn new(config: BridgeConfig, snapshot_tx: watch::Sender<BridgeSnapshot>) -> Self {
        // Unbounded so reader and writer tasks never block on the loop.
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: BridgeState::Unloaded,
            generation: 0,
            module_loads: 0,
            jobs_completed: 0,
            ready_since: None,
            worker: None,
            pending: None,
            load_deadline: None,
            idle_deadline: None,
            events_tx,
            events_rx,
            snapshot_tx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!("Bridge event loop started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }

                command = commands.recv() => match command {
                    Some(Command::Submit(job)) => self.handle_submit(job).await,
                    Some(Command::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                    }
                    None => {
                        tracing::debug!("All bridge handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },

                _ = sleep_until_opt(deadline) => {
                    self.handle_deadline().await;
                }

                _ = caller_gone(&mut self.pending) => {
                    self.handle_caller_gone();
                }
            }
        }
        tracing::debug!("Bridge event loop exiting");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            BridgeState::Loading => self.load_deadline,
            BridgeState::Busy => self.pending.as_ref().and_then(PendingJob::deadline),
            BridgeState::Ready => self.idle_deadline,
            BridgeState::Unloaded | BridgeState::Failed => None,
        }
    }

    fn set_state(&mut self, state: BridgeState) {
        if self.state != state {
            tracing::debug!(
                from = %self.state,
                to = %state,
                generation = self.generation,
                "Bridge state transition"
            );
            self.state = state;
        }
        if state == BridgeState::Ready {
            self.idle_deadline = self.config.idle_timeout.map(|t| Instant::now() + t);
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(BridgeSnapshot {
            state: self.state,
            generation: self.generation,
            module_loads: self.module_loads,
            jobs_completed: self.jobs_completed,
            abandoned_jobs: self.worker.as_ref().map_or(0, |w| w.abandoned.len()),
            ready_since: self.ready_since,
        });
    }

    async fn retire_worker(&mut self, how: Retire) {
        self.load_deadline = None;
        self.idle_deadline = None;
        self.ready_since = None;
        if let Some(worker) = self.worker.take() {
            match how {
                Retire::Kill => worker.kill().await,
                Retire::Graceful => worker.terminate(self.config.shutdown_grace).await,
            }
        }
    }

    fn settle_pending(&mut self, result: Result<ProcessedBytes, BridgeError>) {
        if let Some(job) = self.pending.take() {
            job.settle(result);
        }
    }

    fn pending_matches(&self, request_id: RequestId) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|job| job.request_id == request_id && job.is_dispatched())
    }

    async fn handle_submit(&mut self, job: JobRequest) {
        let JobRequest {
            request_id,
            input,
            options,
            timeout,
            reply,
        } = job;

        // A caller that gave up may not have been noticed yet.
        if self.pending.as_ref().is_some_and(|job| job.reply.is_closed()) {
            self.handle_caller_gone();
        }

        if self.pending.is_some() {
            tracing::warn!(
                target: "codec_bridge::job",
                %request_id,
                state = %self.state,
                "Rejecting job: another job is in flight"
            );
            let _ = reply.send(Err(BridgeError::ConcurrentJobRejected));
            return;
        }

        tracing::debug!(
            target: "codec_bridge::job",
            %request_id,
            format = options.format_name(),
            input_bytes = input.len(),
            state = %self.state,
            "Job submitted"
        );

        if self.worker.as_ref().is_some_and(WorkerConn::needs_recycle) {
            tracing::info!(generation = self.generation, "Recycling worker with abandoned work");
            self.retire_worker(Retire::Kill).await;
            self.set_state(BridgeState::Unloaded);
        }

        self.pending = Some(PendingJob {
            request_id,
            reply,
            submitted_at: Instant::now(),
            timeout: timeout.unwrap_or(self.config.job_timeout),
            dispatched_at: None,
            payload: Some((input, options)),
        });

        match self.state {
            BridgeState::Ready | BridgeState::Busy => self.dispatch(),
            // Dispatched once the worker reports ready.
            BridgeState::Loading => {}
            BridgeState::Unloaded | BridgeState::Failed => self.start_worker(),
        }
    }

    fn start_worker(&mut self) {
        self.generation += 1;
        let generation = self.generation;

        let channels = match self.config.spawner.spawn(generation) {
            Ok(channels) => channels,
            Err(e) => {
                tracing::error!(generation, error = %e, "Failed to spawn worker");
                self.set_state(BridgeState::Failed);
                self.settle_pending(Err(BridgeError::WorkerStartup(e.to_string())));
                return;
            }
        };

        let reader_task = spawn_reader(
            generation,
            channels.reader,
            payload_frame_limit(self.config.max_output_bytes),
            self.events_tx.clone(),
        );
        let request_limit = self
            .config
            .max_input_bytes
            .map_or(MAX_WIRE_FRAME_LENGTH, payload_frame_limit);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let writer_task = spawn_writer(
            generation,
            channels.writer,
            request_limit,
            request_rx,
            self.events_tx.clone(),
        );
        let worker = WorkerConn {
            generation,
            requests,
            writer_task,
            process: channels.process,
            reader_task,
            writing: None,
            suspect: false,
            abandoned: HashSet::new(),
        };
        // A failed write comes back as a worker event.
        worker.send(WorkerRequest::Init {
            protocol_version: PROTOCOL_VERSION,
        });

        tracing::info!(generation, "Worker spawned, loading codec module");
        self.worker = Some(worker);
        self.load_deadline = Some(Instant::now() + self.config.load_timeout);
        self.set_state(BridgeState::Loading);
    }

    fn dispatch(&mut self) {
        // Never send work nobody is waiting for.
        if self.pending.as_ref().is_some_and(|job| job.reply.is_closed()) {
            self.handle_caller_gone();
            return;
        }
        if self.worker.is_none() {
            if self.pending.is_some() {
                self.set_state(BridgeState::Failed);
                self.settle_pending(Err(BridgeError::WorkerCrash("no worker attached".into())));
            }
            return;
        }
        let (Some(job), Some(worker)) = (self.pending.as_mut(), self.worker.as_mut()) else {
            return;
        };
        let Some((input, options)) = job.payload.take() else {
            return;
        };
        let request_id = job.request_id;

        // The deadline covers the write too; a worker that stops reading is as stuck as
        // one that stops answering.
        job.dispatched_at = Some(Instant::now());
        tracing::debug!(
            target: "codec_bridge::job",
            %request_id,
            generation = worker.generation,
            "Dispatching job"
        );
        worker.send_job(request_id, input, options);
        self.set_state(BridgeState::Busy);
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        let current = self.worker.as_ref().map(|w| w.generation);
        if current != Some(event.generation) {
            tracing::trace!(generation = event.generation, "Discarding event from retired worker");
            return;
        }

        match event.kind {
            WorkerEventKind::Message(msg) => self.handle_message(msg).await,
            WorkerEventKind::Malformed(malformed) => self.handle_malformed(malformed),
            WorkerEventKind::Failed(e) => {
                if let Some(too_large) = frame_too_large(&e) {
                    // Estimated from the base64 frame; the body is never read.
                    let size = (too_large.size / 4 * 3) as u64;
                    let limit = self.config.max_output_bytes as u64;
                    tracing::error!(
                        generation = event.generation,
                        frame_bytes = too_large.size,
                        frame_limit = too_large.limit,
                        "Worker output exceeds size cap, killing worker"
                    );
                    self.retire_worker(Retire::Kill).await;
                    self.set_state(BridgeState::Failed);
                    self.settle_pending(Err(BridgeError::OutputTooLarge { size, limit }));
                } else {
                    self.handle_crash(format!("worker channel error: {e}")).await;
                }
            }
            WorkerEventKind::Closed => {
                self.handle_crash("worker exited unexpectedly".to_string())
                    .await;
            }
            WorkerEventKind::Written { request_id } => {
                self.finish_write(request_id);
                tracing::trace!(target: "codec_bridge::job", %request_id, "Job written to worker");
            }
            WorkerEventKind::Unencodable { request_id, error } => {
                self.finish_write(request_id);
                if let Some(worker) = self.worker.as_mut() {
                    // Never reached the worker, so no answer will come.
                    worker.abandoned.remove(&request_id);
                }
                tracing::warn!(
                    target: "codec_bridge::job",
                    %request_id,
                    %error,
                    "Job could not be encoded, worker kept"
                );
                if self.pending_matches(request_id) {
                    self.set_state(BridgeState::Ready);
                    self.settle_pending(Err(BridgeError::InvalidOptions(format!(
                        "job cannot be sent to the worker: {error}"
                    ))));
                } else {
                    self.publish();
                }
            }
        }
    }

    fn finish_write(&mut self, request_id: RequestId) {
        if let Some(worker) = self
            .worker
            .as_mut()
            .filter(|w| w.writing == Some(request_id))
        {
            worker.writing = None;
        }
    }

    async fn handle_crash(&mut self, detail: String) {
        if self.pending.is_some() || self.state == BridgeState::Loading {
            tracing::error!(
                generation = self.generation,
                state = %self.state,
                %detail,
                "Worker crashed"
            );
        } else {
            tracing::warn!(generation = self.generation, %detail, "Idle worker exited");
        }
        self.retire_worker(Retire::Kill).await;
        self.set_state(BridgeState::Failed);
        self.settle_pending(Err(BridgeError::WorkerCrash(detail)));
    }

    fn handle_malformed(&mut self, malformed: MalformedFrame) {
        tracing::warn!(
            generation = self.generation,
            error = %malformed,
            "Malformed frame from worker"
        );
        let Some(job) = self.pending.as_ref() else {
            return;
        };
        // While loading, the job waits and loading carries on for the next caller.
        if job.is_dispatched() {
            self.set_state(BridgeState::Ready);
        }
        self.settle_pending(Err(BridgeError::Protocol(malformed.to_string())));
    }

    fn discard_response(&mut self, request_id: RequestId, kind: &'static str) {
        let abandoned = self
            .worker
            .as_mut()
            .is_some_and(|w| w.abandoned.remove(&request_id));
        if abandoned {
            self.publish();
            tracing::debug!(
                target: "codec_bridge::job",
                %request_id,
                kind,
                "Discarding late response for abandoned job"
            );
        } else {
            tracing::warn!(
                target: "codec_bridge::job",
                %request_id,
                kind,
                "Discarding response with no matching job"
            );
        }
    }

    async fn handle_message(&mut self, msg: WorkerResponse) {
        match msg {
            WorkerResponse::Ready { codec } => {
                if self.state != BridgeState::Loading {
                    tracing::warn!(state = %self.state, "Unexpected ready from worker, ignoring");
                    return;
                }
                self.load_deadline = None;
                self.module_loads += 1;
                self.ready_since = Some(Utc::now());
                tracing::info!(
                    generation = self.generation,
                    codec = codec.as_deref().unwrap_or("unnamed"),
                    "Codec module ready"
                );
                self.set_state(BridgeState::Ready);
                if self.pending.is_some() {
                    self.dispatch();
                }
            }

            WorkerResponse::Log {
                level,
                target,
                message,
            } => emit_worker_log(level, target.as_deref(), &message),

            WorkerResponse::Result {
                request_id,
                output,
                content_type,
            } => {
                if !self.pending_matches(request_id) {
                    self.discard_response(request_id, "result");
                    return;
                }
                let limit = self.config.max_output_bytes;
                let result = if output.len() > limit {
                    tracing::warn!(
                        target: "codec_bridge::job",
                        %request_id,
                        output_bytes = output.len(),
                        limit,
                        "Output exceeds size cap"
                    );
                    Err(BridgeError::OutputTooLarge {
                        size: output.len() as u64,
                        limit: limit as u64,
                    })
                } else {
                    self.jobs_completed += 1;
                    Ok(ProcessedBytes::new(output, content_type))
                };
                self.set_state(BridgeState::Ready);
                self.settle_pending(result);
            }

            WorkerResponse::Error {
                request_id: Some(request_id),
                detail,
            } => {
                if !self.pending_matches(request_id) {
                    self.discard_response(request_id, "error");
                    return;
                }
                self.set_state(BridgeState::Ready);
                self.settle_pending(Err(BridgeError::Processing(detail)));
            }

            WorkerResponse::Error {
                request_id: None,
                detail,
            } => match self.state {
                BridgeState::Loading => {
                    tracing::error!(generation = self.generation, %detail, "Codec module failed to load");
                    self.retire_worker(Retire::Kill).await;
                    self.set_state(BridgeState::Failed);
                    self.settle_pending(Err(BridgeError::ModuleLoad(detail)));
                }
                BridgeState::Busy if self.pending.as_ref().is_some_and(PendingJob::is_dispatched) => {
                    self.set_state(BridgeState::Ready);
                    self.settle_pending(Err(BridgeError::Processing(detail)));
                }
                _ => {
                    tracing::warn!(state = %self.state, %detail, "Unsolicited error from worker");
                }
            },
        }
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();
        match self.state {
            BridgeState::Loading => {
                if self.load_deadline.is_none_or(|d| d > now) {
                    return;
                }
                let load_timeout = self.config.load_timeout;
                tracing::error!(generation = self.generation, ?load_timeout, "Codec module load timed out");
                self.retire_worker(Retire::Kill).await;
                self.set_state(BridgeState::Failed);
                self.settle_pending(Err(BridgeError::ModuleLoad(format!(
                    "timed out after {load_timeout:?}"
                ))));
            }
            BridgeState::Busy => {
                let expired = self
                    .pending
                    .as_ref()
                    .and_then(PendingJob::deadline)
                    .is_some_and(|d| d <= now);
                if !expired {
                    return;
                }
                let Some(job) = self.pending.take() else {
                    return;
                };
                let request_id = job.request_id;
                tracing::warn!(
                    target: "codec_bridge::job",
                    %request_id,
                    timeout = ?job.timeout,
                    generation = self.generation,
                    "Job timed out, worker will be replaced before the next job"
                );
                if let Some(worker) = self.worker.as_mut() {
                    worker.suspect = true;
                    worker.abandoned.insert(request_id);
                    worker.send(WorkerRequest::Cancel { request_id });
                }
                let timeout = job.timeout;
                self.set_state(BridgeState::Ready);
                job.settle(Err(BridgeError::Timeout(timeout)));
            }
            BridgeState::Ready => {
                if self.idle_deadline.is_none_or(|d| d > now) {
                    return;
                }
                tracing::info!(generation = self.generation, "Worker idle, shutting it down");
                self.retire_worker(Retire::Graceful).await;
                self.set_state(BridgeState::Unloaded);
            }
            BridgeState::Unloaded | BridgeState::Failed => {}
        }
    }

    fn handle_caller_gone(&mut self) {
        let Some(job) = self.pending.take() else {
            return;
        };
        let request_id = job.request_id;

        if job.is_dispatched() {
            tracing::debug!(
                target: "codec_bridge::job",
                %request_id,
                "Caller stopped waiting, abandoning job"
            );
            if let Some(worker) = self.worker.as_mut() {
                worker.abandoned.insert(request_id);
                worker.send(WorkerRequest::Cancel { request_id });
            }
            self.set_state(BridgeState::Ready);
        } else {
            // Never reached the worker; loading carries on for the next caller.
            tracing::debug!(
                target: "codec_bridge::job",
                %request_id,
                "Caller stopped waiting before dispatch"
            );
        }
        job.settle(Err(BridgeError::Cancelled));
    }

    async fn shutdown(&mut self) {
        if self.worker.is_some() || self.pending.is_some() {
            tracing::info!(generation = self.generation, state = %self.state, "Shutting down bridge");
        }
        let job = self.pending.take();
        self.retire_worker(Retire::Graceful).await;
        self.set_state(BridgeState::Unloaded);
        if let Some(job) = job {
            job.settle(Err(BridgeError::Shutdown));
        }
    }
}
