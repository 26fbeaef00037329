//! Worker runtime - the child side of the bridge protocol.
//!
//! Hosts one [`CodecHandler`] behind the message protocol. The parent side
//! (spawning, correlation, timeouts) lives in `bridge`.
//!
//! Lifecycle:
//! 1. Wait for Init, load the codec module once, reply Ready (or Error)
//! 2. Run jobs one at a time in arrival order, one Result/Error per job
//! 3. Exit on Shutdown or when the request stream closes

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::ipc::codec::JsonCodec;
use crate::ipc::protocol::{LogLevel, RequestId, WorkerRequest, WorkerResponse};
use crate::options::{CodecOptions, ProcessedBytes};
use crate::version::PROTOCOL_VERSION;

/// Codec failures reported back to the bridge.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The codec module could not be loaded (missing binary, bad WASM, ...).
    #[error("failed to load codec module: {message}")]
    Load { message: String },

    /// The codec rejected or choked on one input.
    #[error("{message}")]
    Processing { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl CodecError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }
}

/// Handle for emitting diagnostics while a job runs.
#[derive(Clone)]
pub struct JobLogger {
    request_id: RequestId,
    tx: mpsc::UnboundedSender<WorkerResponse>,
}

impl JobLogger {
    fn new(request_id: RequestId, tx: mpsc::UnboundedSender<WorkerResponse>) -> Self {
        Self { request_id, tx }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn log(&self, level: LogLevel, message: &str) -> io::Result<()> {
        if message.is_empty() {
            return Ok(());
        }
        self.tx
            .send(WorkerResponse::Log {
                level,
                target: None,
                message: message.to_string(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker channel closed"))
    }

    pub fn info(&self, message: &str) -> io::Result<()> {
        self.log(LogLevel::Info, message)
    }

    pub fn warn(&self, message: &str) -> io::Result<()> {
        self.log(LogLevel::Warn, message)
    }
}

/// The opaque codec a worker hosts.
#[async_trait::async_trait]
pub trait CodecHandler: Send + Sync + 'static {
    /// Load the codec module. Called once per worker, before Ready is sent.
    async fn load(&self) -> Result<(), CodecError>;

    /// Transform one input buffer.
    async fn process(
        &self,
        request_id: RequestId,
        input: Bytes,
        options: CodecOptions,
        logger: JobLogger,
    ) -> Result<ProcessedBytes, CodecError>;

    /// Request cancellation of a running job. Most codecs cannot be
    /// interrupted, so the default ignores it.
    fn cancel(&self, _request_id: RequestId) {}

    /// Reported in the Ready message.
    fn name(&self) -> Option<String> {
        None
    }
}

#[derive(Default)]
pub struct WorkerConfig {
    /// Extra log messages (e.g. from `WorkerTracingLayer`) merged into the
    /// outbound stream.
    pub log_stream: Option<mpsc::Receiver<WorkerResponse>>,
}

struct QueuedJob {
    request_id: RequestId,
    input: Bytes,
    options: CodecOptions,
}

/// Run the worker protocol over stdin/stdout.
pub async fn run_worker_stdio<H>(handler: Arc<H>, config: WorkerConfig) -> io::Result<()>
where
    H: CodecHandler + ?Sized,
{
    run_worker(handler, tokio::io::stdin(), tokio::io::stdout(), config).await
}

/// Run the worker event loop until Shutdown or until `reader` closes.
pub async fn run_worker<H, R, W>(
    handler: Arc<H>,
    reader: R,
    writer: W,
    config: WorkerConfig,
) -> io::Result<()>
where
    H: CodecHandler + ?Sized,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut requests = FramedRead::new(reader, JsonCodec::<WorkerRequest>::new());

    // Tasks live in JoinSets owned by this future: dropping or aborting the
    // worker aborts the jobs and log forwarding it started.
    let mut writer_task = JoinSet::new();
    let mut log_forwarder = JoinSet::new();
    let mut jobs: JoinSet<()> = JoinSet::new();

    // Every outbound frame goes through one writer task so frames never interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerResponse>();
    writer_task.spawn(async move {
        let mut writer = FramedWrite::new(writer, JsonCodec::<WorkerResponse>::new());
        while let Some(msg) = out_rx.recv().await {
            writer.send(msg).await?;
        }
        Ok::<(), io::Error>(())
    });

    if let Some(mut log_rx) = config.log_stream {
        let out_tx = out_tx.clone();
        log_forwarder.spawn(async move {
            while let Some(msg) = log_rx.recv().await {
                if out_tx.send(msg).is_err() {
                    break;
                }
            }
        });
    }

    let mut queue: VecDeque<QueuedJob> = VecDeque::new();
    // At most one job task is in `jobs` at a time.
    let mut running: Option<RequestId> = None;
    let mut loaded = false;

    loop {
        tokio::select! {
            biased;

            Some(joined) = jobs.join_next(), if running.is_some() => {
                if let (Err(e), Some(request_id)) = (joined, running) {
                    if e.is_panic() {
                        tracing::error!(%request_id, "Codec panicked");
                        let _ = out_tx.send(WorkerResponse::Error {
                            request_id: Some(request_id),
                            detail: "codec panicked".to_string(),
                        });
                    }
                }
                running = queue
                    .pop_front()
                    .map(|job| start_job(&mut jobs, &handler, &out_tx, job));
            }

            request = requests.next() => {
                match request {
                    Some(Ok(Ok(WorkerRequest::Init { protocol_version }))) => {
                        if loaded {
                            tracing::warn!("Received Init after module load, ignoring");
                            continue;
                        }
                        if protocol_version != PROTOCOL_VERSION {
                            tracing::error!(protocol_version, expected = PROTOCOL_VERSION, "Protocol version mismatch");
                            let _ = out_tx.send(WorkerResponse::Error {
                                request_id: None,
                                detail: format!(
                                    "unsupported protocol version {protocol_version} (worker speaks {PROTOCOL_VERSION})"
                                ),
                            });
                            continue;
                        }

                        tracing::info!("Loading codec module");
                        let started = Instant::now();
                        match handler.load().await {
                            Ok(()) => {
                                loaded = true;
                                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Codec module loaded");
                                let _ = out_tx.send(WorkerResponse::Ready { codec: handler.name() });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Codec module failed to load");
                                let _ = out_tx.send(WorkerResponse::Error {
                                    request_id: None,
                                    detail: e.to_string(),
                                });
                            }
                        }
                    }
                    Some(Ok(Ok(WorkerRequest::Job { request_id, input, options }))) => {
                        if !loaded {
                            tracing::warn!(%request_id, "Job received before module load");
                            let _ = out_tx.send(WorkerResponse::Error {
                                request_id: Some(request_id),
                                detail: "codec module not loaded".to_string(),
                            });
                            continue;
                        }
                        tracing::trace!(%request_id, input_bytes = input.len(), "Job received");
                        let job = QueuedJob { request_id, input, options };
                        if running.is_none() {
                            running = Some(start_job(&mut jobs, &handler, &out_tx, job));
                        } else {
                            queue.push_back(job);
                        }
                    }
                    Some(Ok(Ok(WorkerRequest::Cancel { request_id }))) => {
                        if running == Some(request_id) {
                            tracing::debug!(%request_id, "Cancel requested for running job");
                            handler.cancel(request_id);
                        } else if let Some(pos) = queue.iter().position(|j| j.request_id == request_id) {
                            queue.remove(pos);
                            tracing::debug!(%request_id, "Cancelled queued job");
                            let _ = out_tx.send(WorkerResponse::Error {
                                request_id: Some(request_id),
                                detail: CodecError::Cancelled.to_string(),
                            });
                        } else {
                            tracing::trace!(%request_id, "Cancel for unknown job, ignoring");
                        }
                    }
                    Some(Ok(Ok(WorkerRequest::Shutdown))) => {
                        tracing::info!("Shutdown requested");
                        break;
                    }
                    Some(Ok(Err(malformed))) => {
                        tracing::warn!(error = %malformed, "Malformed request, ignoring");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Request channel error");
                        break;
                    }
                    None => {
                        tracing::info!("Request channel closed (bridge gone?), exiting");
                        break;
                    }
                }
            }
        }
    }

    if let Some(request_id) = running.take() {
        tracing::debug!(%request_id, "Aborting in-flight job");
    }
    jobs.shutdown().await;
    log_forwarder.shutdown().await;
    drop(out_tx);

    match writer_task.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(io::Error::other(e)),
        None => Ok(()),
    }
}

fn start_job<H>(
    jobs: &mut JoinSet<()>,
    handler: &Arc<H>,
    out_tx: &mpsc::UnboundedSender<WorkerResponse>,
    job: QueuedJob,
) -> RequestId
where
    H: CodecHandler + ?Sized,
{
    let QueuedJob {
        request_id,
        input,
        options,
    } = job;
    let handler = Arc::clone(handler);
    let out_tx = out_tx.clone();

    jobs.spawn(async move {
        let started = Instant::now();
        let logger = JobLogger::new(request_id, out_tx.clone());
        let response = match handler.process(request_id, input, options, logger).await {
            Ok(output) => {
                tracing::debug!(
                    %request_id,
                    output_bytes = output.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job succeeded"
                );
                WorkerResponse::Result {
                    request_id,
                    output: output.bytes,
                    content_type: output.content_type,
                }
            }
            Err(e) => {
                tracing::debug!(%request_id, error = %e, "Job failed");
                WorkerResponse::Error {
                    request_id: Some(request_id),
                    detail: e.to_string(),
                }
            }
        };
        let _ = out_tx.send(response);
    });

    request_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    use crate::options::{ImageMime, PdfQualityProfile};

    struct Reverse {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl CodecHandler for Reverse {
        async fn load(&self) -> Result<(), CodecError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn process(
            &self,
            _request_id: RequestId,
            input: Bytes,
            options: CodecOptions,
            logger: JobLogger,
        ) -> Result<ProcessedBytes, CodecError> {
            if input.is_empty() {
                return Err(CodecError::processing("empty input"));
            }
            let _ = logger.info("reversing");
            let mut out = input.to_vec();
            out.reverse();
            Ok(ProcessedBytes::new(out, options.output_content_type()))
        }

        fn name(&self) -> Option<String> {
            Some("reverse".to_string())
        }
    }

    struct BrokenModule;

    #[async_trait::async_trait]
    impl CodecHandler for BrokenModule {
        async fn load(&self) -> Result<(), CodecError> {
            Err(CodecError::load("gs.wasm: 404"))
        }

        async fn process(
            &self,
            _request_id: RequestId,
            _input: Bytes,
            _options: CodecOptions,
            _logger: JobLogger,
        ) -> Result<ProcessedBytes, CodecError> {
            unreachable!("never loaded")
        }
    }

    struct Peer {
        requests: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<WorkerRequest>>,
        responses: FramedRead<ReadHalf<DuplexStream>, JsonCodec<WorkerResponse>>,
        worker: JoinHandle<io::Result<()>>,
    }

    impl Peer {
        fn start<H: CodecHandler>(handler: H) -> Self {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let (their_read, their_write) = tokio::io::split(theirs);
            let worker = tokio::spawn(run_worker(
                Arc::new(handler),
                their_read,
                their_write,
                WorkerConfig::default(),
            ));
            let (our_read, our_write) = tokio::io::split(ours);
            Self {
                requests: FramedWrite::new(our_write, JsonCodec::new()),
                responses: FramedRead::new(our_read, JsonCodec::new()),
                worker,
            }
        }

        async fn send(&mut self, req: WorkerRequest) {
            self.requests.send(req).await.unwrap();
        }

        /// Next non-log response.
        async fn recv(&mut self) -> WorkerResponse {
            loop {
                let msg = self.responses.next().await.unwrap().unwrap().unwrap();
                if !matches!(msg, WorkerResponse::Log { .. }) {
                    return msg;
                }
            }
        }
    }

    fn init() -> WorkerRequest {
        WorkerRequest::Init {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn pdf_job(request_id: RequestId, input: &'static [u8]) -> WorkerRequest {
        WorkerRequest::Job {
            request_id,
            input: Bytes::from_static(input),
            options: CodecOptions::pdf_compress(PdfQualityProfile::Ebook),
        }
    }

    #[tokio::test]
    async fn init_then_jobs_in_order() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut peer = Peer::start(Reverse {
            loads: Arc::clone(&loads),
        });

        peer.send(init()).await;
        match peer.recv().await {
            WorkerResponse::Ready { codec } => assert_eq!(codec.as_deref(), Some("reverse")),
            other => panic!("expected ready, got {other:?}"),
        }

        let first = RequestId::new();
        let second = RequestId::new();
        peer.send(pdf_job(first, b"abc")).await;
        peer.send(pdf_job(second, b"xyz")).await;

        match peer.recv().await {
            WorkerResponse::Result {
                request_id,
                output,
                content_type,
            } => {
                assert_eq!(request_id, first);
                assert_eq!(&output[..], b"cba");
                assert_eq!(content_type, "application/pdf");
            }
            other => panic!("expected result, got {other:?}"),
        }
        match peer.recv().await {
            WorkerResponse::Result { request_id, output, .. } => {
                assert_eq!(request_id, second);
                assert_eq!(&output[..], b"zyx");
            }
            other => panic!("expected result, got {other:?}"),
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        peer.send(WorkerRequest::Shutdown).await;
        peer.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn job_logs_are_forwarded() {
        let mut peer = Peer::start(Reverse {
            loads: Arc::new(AtomicUsize::new(0)),
        });
        peer.send(init()).await;
        peer.recv().await;

        peer.send(pdf_job(RequestId::new(), b"ab")).await;
        let msg = peer.responses.next().await.unwrap().unwrap().unwrap();
        match msg {
            WorkerResponse::Log { level, message, .. } => {
                assert_eq!(level, LogLevel::Info);
                assert_eq!(message, "reversing");
            }
            other => panic!("expected log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn job_before_init_is_refused() {
        let mut peer = Peer::start(Reverse {
            loads: Arc::new(AtomicUsize::new(0)),
        });
        let id = RequestId::new();
        peer.send(pdf_job(id, b"abc")).await;
        match peer.recv().await {
            WorkerResponse::Error { request_id, detail } => {
                assert_eq!(request_id, Some(id));
                assert_eq!(detail, "codec module not loaded");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn processing_error_carries_request_id() {
        let mut peer = Peer::start(Reverse {
            loads: Arc::new(AtomicUsize::new(0)),
        });
        peer.send(init()).await;
        peer.recv().await;

        let id = RequestId::new();
        peer.send(WorkerRequest::Job {
            request_id: id,
            input: Bytes::new(),
            options: CodecOptions::image(ImageMime::Jpeg, 0.5),
        })
        .await;
        match peer.recv().await {
            WorkerResponse::Error { request_id, detail } => {
                assert_eq!(request_id, Some(id));
                assert_eq!(detail, "empty input");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_failure_reports_error_without_id() {
        let mut peer = Peer::start(BrokenModule);
        peer.send(init()).await;
        match peer.recv().await {
            WorkerResponse::Error { request_id, detail } => {
                assert!(request_id.is_none());
                assert_eq!(detail, "failed to load codec module: gs.wasm: 404");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn protocol_mismatch_is_refused() {
        let mut peer = Peer::start(Reverse {
            loads: Arc::new(AtomicUsize::new(0)),
        });
        peer.send(WorkerRequest::Init {
            protocol_version: PROTOCOL_VERSION + 1,
        })
        .await;
        assert!(matches!(
            peer.recv().await,
            WorkerResponse::Error {
                request_id: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn exits_when_bridge_closes() {
        let peer = Peer::start(Reverse {
            loads: Arc::new(AtomicUsize::new(0)),
        });
        let Peer {
            requests,
            responses,
            worker,
        } = peer;
        drop(requests);
        drop(responses);
        let result = worker.await.unwrap();
        assert!(
            result
                .as_ref()
                .map_or_else(|e| e.kind() == io::ErrorKind::BrokenPipe, |_| true),
            "{result:?}"
        );
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Never finishes a job; records when the job future is dropped.
    struct Stuck {
        started: Arc<Notify>,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl CodecHandler for Stuck {
        async fn load(&self) -> Result<(), CodecError> {
            Ok(())
        }

        async fn process(
            &self,
            _request_id: RequestId,
            _input: Bytes,
            _options: CodecOptions,
            _logger: JobLogger,
        ) -> Result<ProcessedBytes, CodecError> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            self.started.notify_one();
            std::future::pending::<()>().await;
            Err(CodecError::processing("unreachable"))
        }
    }

    #[tokio::test]
    async fn aborting_worker_task_drops_running_job() {
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let mut peer = Peer::start(Stuck {
            started: Arc::clone(&started),
            dropped: Arc::clone(&dropped),
        });
        peer.send(init()).await;
        peer.recv().await;
        peer.send(pdf_job(RequestId::new(), b"stuck")).await;
        started.notified().await;
        assert!(!dropped.load(Ordering::SeqCst));

        peer.worker.abort();
        assert!(peer.worker.await.unwrap_err().is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("job future dropped with its worker");
    }

    #[tokio::test]
    async fn shutdown_drops_running_job() {
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let mut peer = Peer::start(Stuck {
            started: Arc::clone(&started),
            dropped: Arc::clone(&dropped),
        });
        peer.send(init()).await;
        peer.recv().await;
        peer.send(pdf_job(RequestId::new(), b"stuck")).await;
        started.notified().await;

        peer.send(WorkerRequest::Shutdown).await;
        peer.worker.await.unwrap().unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    struct Panics;

    #[async_trait::async_trait]
    impl CodecHandler for Panics {
        async fn load(&self) -> Result<(), CodecError> {
            Ok(())
        }

        async fn process(
            &self,
            _request_id: RequestId,
            input: Bytes,
            options: CodecOptions,
            _logger: JobLogger,
        ) -> Result<ProcessedBytes, CodecError> {
            if &input[..] == b"boom" {
                panic!("decoder exploded");
            }
            Ok(ProcessedBytes::new(input, options.output_content_type()))
        }
    }

    #[tokio::test]
    async fn panicking_job_reports_error_and_next_job_runs() {
        let mut peer = Peer::start(Panics);
        peer.send(init()).await;
        peer.recv().await;

        let boom = RequestId::new();
        let fine = RequestId::new();
        peer.send(pdf_job(boom, b"boom")).await;
        peer.send(pdf_job(fine, b"fine")).await;

        match peer.recv().await {
            WorkerResponse::Error { request_id, detail } => {
                assert_eq!(request_id, Some(boom));
                assert_eq!(detail, "codec panicked");
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(
            peer.recv().await,
            WorkerResponse::Result { request_id, .. } if request_id == fine
        ));
    }
}
