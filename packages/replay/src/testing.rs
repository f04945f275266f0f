// packages/replay/src/testing.rs
//! Test doubles shared by the unit tests

use crate::observability::{DiagnosticEvent, DiagnosticSink};
use crate::recorder::collaborators::{
    CaptureFactory, CaptureSession, EnvironmentProbe, PageReadiness, RecordSink, SessionProvider,
};
use crate::recording::collection::{ContextProvider, SegmentTimer, TimerToken};
use crate::recording::payload::{SegmentPayload, SegmentTransport};
use crate::recording::record::{Record, RecordType};
use crate::recording::segment::SegmentContext;
use crate::utils::errors::{ReplayError, Result as ReplayResult, WorkerUnavailable};
use crate::worker::channel::{WorkerFactory, WorkerLink};
use crate::worker::compressor::{CompressionLevel, CompressionWorker};
use crate::worker::protocol::{WorkerEndpoint, WorkerEvent, WorkerRequest, WorkerResponse};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};

/// Sink keeping every report
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, event: &DiagnosticEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Worker driven by hand from the test
pub struct ManualWorker {
    requests: crossbeam_channel::Receiver<WorkerRequest>,
    events: UnboundedSender<WorkerEvent>,
}

impl ManualWorker {
    pub fn next_request(&self) -> Option<WorkerRequest> {
        self.requests.try_recv().ok()
    }

    pub fn send(&self, response: WorkerResponse) {
        let _ = self.events.send(WorkerEvent::Message(response));
    }

    pub fn crash(&self, message: &str) {
        let _ = self.events.send(WorkerEvent::Crashed(message.to_string()));
    }
}

/// Factory handing out [`ManualWorker`]s; workers stay alive until taken
#[derive(Default)]
pub struct ManualWorkerFactory {
    workers: Mutex<Vec<ManualWorker>>,
    created: AtomicU64,
}

impl ManualWorkerFactory {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn take_worker(&self) -> Option<ManualWorker> {
        self.workers.lock().pop()
    }
}

impl WorkerFactory for ManualWorkerFactory {
    fn create(&self) -> Result<WorkerEndpoint, WorkerUnavailable> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.created.fetch_add(1, Ordering::SeqCst);
        self.workers.lock().push(ManualWorker {
            requests: request_rx,
            events: event_tx,
        });

        Ok(WorkerEndpoint {
            requests: request_tx,
            events: event_rx,
        })
    }
}

/// Real compression run synchronously on the test thread
///
/// Responses are returned to the caller instead of being routed, so tests
/// decide when (and in which order) streams see them.
pub struct InlineWorker {
    worker: CompressionWorker,
    inbox: crossbeam_channel::Receiver<WorkerRequest>,
    link: WorkerLink,
}

impl InlineWorker {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            worker: CompressionWorker::new(CompressionLevel::Fast),
            inbox: rx,
            link: WorkerLink::new(tx, "test"),
        }
    }

    pub fn link(&self) -> WorkerLink {
        self.link.clone()
    }

    /// Handle queued requests until one produces a response
    pub fn process_next(&mut self) -> Option<WorkerResponse> {
        while let Ok(request) = self.inbox.try_recv() {
            if let Some(response) = self.worker.handle(request) {
                return Some(response);
            }
        }
        None
    }

    pub fn process_all(&mut self) -> Vec<WorkerResponse> {
        std::iter::from_fn(|| self.process_next()).collect()
    }
}

/// Decompress an encoder output; empty input decodes to nothing
pub fn decode(output: &[u8]) -> String {
    if output.is_empty() {
        return String::new();
    }
    let bytes = zstd::decode_all(output).unwrap();
    String::from_utf8(bytes).unwrap()
}

/// Rebuild and parse a segment document from compressed and pending parts
pub fn full_document(output: &[u8], pending_data: &str) -> serde_json::Value {
    let text = format!("{}{}", decode(output), pending_data);
    serde_json::from_str(&text).unwrap()
}

pub fn record(timestamp: i64) -> Record {
    Record::new(
        RecordType::IncrementalSnapshot,
        timestamp,
        serde_json::json!({"source": 0}),
    )
}

/// Timer that only remembers what it was asked to do
#[derive(Default)]
pub struct ManualTimer {
    next_token: AtomicU64,
    scheduled: Mutex<Vec<(TimerToken, Duration)>>,
    cancelled: Mutex<Vec<TimerToken>>,
}

impl ManualTimer {
    pub fn scheduled(&self) -> Vec<(TimerToken, Duration)> {
        self.scheduled.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<TimerToken> {
        self.cancelled.lock().clone()
    }
}

impl SegmentTimer for ManualTimer {
    fn schedule(&self, delay: Duration) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.scheduled.lock().push((token, delay));
        token
    }

    fn cancel(&self, token: TimerToken) {
        self.cancelled.lock().push(token);
    }
}

#[derive(Debug, Clone)]
pub struct SentPayload {
    pub payload: SegmentPayload,
    pub on_exit: bool,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentPayload>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<SentPayload> {
        self.sent.lock().clone()
    }
}

impl SegmentTransport for RecordingTransport {
    fn send(&self, payload: SegmentPayload) {
        self.sent.lock().push(SentPayload {
            payload,
            on_exit: false,
        });
    }

    fn send_on_exit(&self, payload: SegmentPayload) {
        self.sent.lock().push(SentPayload {
            payload,
            on_exit: true,
        });
    }
}

/// Context provider whose answer the test controls
pub struct FixedContext {
    view_id: String,
    context: Mutex<Option<SegmentContext>>,
}

impl FixedContext {
    pub fn new(view_id: &str) -> Self {
        Self {
            view_id: view_id.to_string(),
            context: Mutex::new(Some(Self::context_for(view_id))),
        }
    }

    pub fn set(&self, context: Option<SegmentContext>) {
        *self.context.lock() = context;
    }

    pub fn is_set(&self) -> bool {
        self.context.lock().is_some()
    }

    /// Flip between no context and the initial view
    pub fn toggle(&self) {
        let mut context = self.context.lock();
        *context = match context.take() {
            Some(_) => None,
            None => Some(Self::context_for(&self.view_id)),
        };
    }

    fn context_for(view_id: &str) -> SegmentContext {
        SegmentContext {
            application_id: "app".to_string(),
            session_id: "session".to_string(),
            view_id: view_id.to_string(),
        }
    }
}

impl ContextProvider for FixedContext {
    fn compute_context(&self) -> Option<SegmentContext> {
        self.context.lock().clone()
    }
}

/// Switchable answer for the session, environment and readiness probes
pub struct Flag(AtomicBool);

impl Flag {
    pub fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl SessionProvider for Flag {
    fn is_replay_allowed(&self) -> bool {
        self.get()
    }
}

impl EnvironmentProbe for Flag {
    fn is_recording_supported(&self) -> bool {
        self.get()
    }
}

impl PageReadiness for Flag {
    fn is_interactive(&self) -> bool {
        self.get()
    }
}

/// Capture that snapshots a single node and replays queued mutations
#[derive(Default)]
pub struct FakeCaptureFactory {
    started: AtomicUsize,
    stopped: Arc<AtomicUsize>,
    failing: AtomicBool,
    sinks: Mutex<Vec<RecordSink>>,
    mutations: Arc<Mutex<Vec<Record>>>,
}

impl FakeCaptureFactory {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn last_sink(&self) -> Option<RecordSink> {
        self.sinks.lock().last().cloned()
    }

    /// Returned by the next `flush_mutations`
    pub fn queue_mutation(&self, record: Record) {
        self.mutations.lock().push(record);
    }
}

impl CaptureFactory for FakeCaptureFactory {
    fn start(&self, sink: RecordSink) -> ReplayResult<Box<dyn CaptureSession>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReplayError::CaptureFailed("capture refused to start".into()));
        }

        self.started.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().push(sink);
        Ok(Box::new(FakeCaptureSession {
            stopped: self.stopped.clone(),
            mutations: self.mutations.clone(),
        }))
    }
}

struct FakeCaptureSession {
    stopped: Arc<AtomicUsize>,
    mutations: Arc<Mutex<Vec<Record>>>,
}

impl CaptureSession for FakeCaptureSession {
    fn flush_mutations(&mut self) -> Vec<Record> {
        std::mem::take(&mut *self.mutations.lock())
    }

    fn take_full_snapshot(&mut self, timestamp: i64) -> Vec<Record> {
        vec![Record::new(
            RecordType::FullSnapshot,
            timestamp,
            serde_json::json!({"node": "document"}),
        )]
    }

    fn stop(&mut self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}
