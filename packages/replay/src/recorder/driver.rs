// packages/replay/src/recorder/driver.rs
//! Async driver executing the recorder state machine
//!
//! A single task owns the recorder: the lifecycle status, the running
//! recording and the collections still draining after a stop. Everything
//! reaches it as a message (host commands, captured records, worker
//! responses, expired timers, worker acquisition and loss), so no state is
//! ever touched from two places.

use crate::observability::{names, DiagnosticKind, Diagnostics};
use crate::recorder::collaborators::{
    CaptureFactory, CaptureSession, ContextProvider, EnvironmentProbe, PageReadiness, RecordSink,
    RecordingId, SegmentTransport, SessionProvider,
};
use crate::recorder::state_machine::{transition, Effect, RecorderEvent, RecorderStatus, Transition};
use crate::recording::collection::{
    CollectionDeps, SegmentCollection, SegmentLimits, SegmentTimer, TimerToken,
};
use crate::recording::record::Record;
use crate::recording::segment::CreationReason;
use crate::recording::stats::{ReplayStats, ViewReplayStats};
use crate::utils::errors::{ReplayError, Result, WorkerUnavailable};
use crate::utils::now_ms;
use crate::worker::channel::{WorkerAvailability, WorkerChannel, WorkerLink};
use crate::worker::protocol::WorkerResponse;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Page lifecycle notifications that end the current segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEvent {
    ViewChange,
    BeforeUnload,
    PageExit,
    VisibilityHidden,
}

impl PageEvent {
    pub fn flush_reason(&self) -> CreationReason {
        match self {
            PageEvent::ViewChange => CreationReason::ViewChange,
            PageEvent::BeforeUnload => CreationReason::BeforeUnload,
            PageEvent::PageExit => CreationReason::PageExit,
            PageEvent::VisibilityHidden => CreationReason::VisibilityHidden,
        }
    }
}

/// Collaborators the recorder is built from
pub struct RecorderDeps {
    pub capture: Arc<dyn CaptureFactory>,
    pub session: Arc<dyn SessionProvider>,
    pub environment: Arc<dyn EnvironmentProbe>,
    pub page: Arc<dyn PageReadiness>,
    pub context: Arc<dyn ContextProvider>,
    pub transport: Arc<dyn SegmentTransport>,
    pub worker: WorkerChannel,
    pub diagnostics: Diagnostics,
}

/// Duration timers backed by Tokio tasks
pub struct TokioTimer {
    next_token: AtomicU64,
    fired: UnboundedSender<TimerToken>,
    tasks: Mutex<HashMap<TimerToken, JoinHandle<()>>>,
}

impl TokioTimer {
    pub fn new(fired: UnboundedSender<TimerToken>) -> Self {
        Self {
            next_token: AtomicU64::new(0),
            fired,
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl SegmentTimer for TokioTimer {
    /// Must be called from within a Tokio runtime
    fn schedule(&self, delay: Duration) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let fired = self.fired.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(token);
        });
        self.tasks.lock().insert(token, task);

        token
    }

    fn cancel(&self, token: TimerToken) {
        if let Some(task) = self.tasks.lock().remove(&token) {
            task.abort();
        }
    }
}

enum RecorderCommand {
    Start,
    Stop,
    SessionRenewed,
    SessionExpired,
    DocumentInteractive,
    AddRecord(Record),
    PageEvent(PageEvent),
    Status(oneshot::Sender<RecorderStatus>),
    ReplayStats {
        view_id: String,
        reply: oneshot::Sender<Option<ViewReplayStats>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle on a running recorder
///
/// Dropping the last handle stops the recorder like [`RecorderHandle::shutdown`]
/// does; segments already flushed are still delivered before the task ends.
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    commands: UnboundedSender<RecorderCommand>,
}

impl RecorderHandle {
    /// Ask the recorder to start; it starts once the session and page allow it
    pub fn start(&self) -> Result<()> {
        self.send(RecorderCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(RecorderCommand::Stop)
    }

    /// A new session is tracked; re-evaluates whether recording may start
    pub fn session_renewed(&self) -> Result<()> {
        self.send(RecorderCommand::SessionRenewed)
    }

    pub fn session_expired(&self) -> Result<()> {
        self.send(RecorderCommand::SessionExpired)
    }

    pub fn document_interactive(&self) -> Result<()> {
        self.send(RecorderCommand::DocumentInteractive)
    }

    /// Add a record to the running recording; dropped when not started
    pub fn add_record(&self, record: Record) -> Result<()> {
        self.send(RecorderCommand::AddRecord(record))
    }

    pub fn page_event(&self, event: PageEvent) -> Result<()> {
        self.send(RecorderCommand::PageEvent(event))
    }

    pub async fn status(&self) -> Result<RecorderStatus> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::Status(reply))?;
        response.await.map_err(|_| ReplayError::RecorderClosed)
    }

    pub async fn replay_stats(&self, view_id: &str) -> Result<Option<ViewReplayStats>> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::ReplayStats {
            view_id: view_id.to_string(),
            reply,
        })?;
        response.await.map_err(|_| ReplayError::RecorderClosed)
    }

    /// Stop recording, wait for every flushed segment to be delivered and
    /// end the recorder task
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(RecorderCommand::Shutdown(reply))?;
        response.await.map_err(|_| ReplayError::RecorderClosed)
    }

    fn send(&self, command: RecorderCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ReplayError::RecorderClosed)
    }
}

/// Recorder builder; [`Recorder::spawn`] moves it onto a Tokio task
pub struct Recorder {
    deps: RecorderDeps,
    limits: SegmentLimits,
}

impl Recorder {
    pub fn new(deps: RecorderDeps, limits: SegmentLimits) -> Self {
        Self { deps, limits }
    }

    pub fn spawn(self) -> RecorderHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (records_tx, records) = mpsc::unbounded_channel();
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let (timers_tx, timers) = mpsc::unbounded_channel();
        let (workers_tx, workers) = mpsc::unbounded_channel();
        let (losses_tx, losses) = mpsc::unbounded_channel();

        let task = RecorderTask {
            status: RecorderStatus::Stopped,
            deps: self.deps,
            limits: self.limits,
            timer: Arc::new(TokioTimer::new(timers_tx)),
            records: records_tx,
            responses: responses_tx,
            worker_ready: workers_tx,
            worker_lost: losses_tx,
            link: None,
            link_watch: None,
            worker_attempt: 0,
            listening_interactive: false,
            recording: None,
            draining: Vec::new(),
            next_recording_id: 0,
            stats: Arc::default(),
            closing: false,
            handles_dropped: false,
            shutdown: Vec::new(),
        };

        tokio::spawn(task.run(Inboxes {
            commands,
            records,
            responses,
            timers,
            workers,
            losses,
        }));

        RecorderHandle {
            commands: commands_tx,
        }
    }
}

struct Inboxes {
    commands: UnboundedReceiver<RecorderCommand>,
    records: UnboundedReceiver<(RecordingId, Record)>,
    responses: UnboundedReceiver<WorkerResponse>,
    timers: UnboundedReceiver<TimerToken>,
    workers: UnboundedReceiver<(u64, WorkerAvailability)>,
    losses: UnboundedReceiver<u64>,
}

struct ActiveRecording {
    id: RecordingId,
    capture: Box<dyn CaptureSession>,
    collection: SegmentCollection,
}

struct RecorderTask {
    status: RecorderStatus,
    deps: RecorderDeps,
    limits: SegmentLimits,
    timer: Arc<dyn SegmentTimer>,

    // Senders handed to capture sessions, collections and helper tasks
    records: UnboundedSender<(RecordingId, Record)>,
    responses: UnboundedSender<WorkerResponse>,
    worker_ready: UnboundedSender<(u64, WorkerAvailability)>,
    worker_lost: UnboundedSender<u64>,

    link: Option<WorkerLink>,
    /// Resolves when `link`'s worker goes away, whether or not a stream is open
    link_watch: Option<JoinHandle<()>>,
    /// Acquisition results tagged with an older attempt are stale
    worker_attempt: u64,
    listening_interactive: bool,

    recording: Option<ActiveRecording>,
    /// Stopped collections whose flushed segments are still finishing
    draining: Vec<SegmentCollection>,
    next_recording_id: RecordingId,
    stats: Arc<Mutex<ReplayStats>>,

    closing: bool,
    handles_dropped: bool,
    shutdown: Vec<oneshot::Sender<()>>,
}

impl RecorderTask {
    async fn run(mut self, mut inboxes: Inboxes) {
        debug!("Recorder task running");

        loop {
            tokio::select! {
                command = inboxes.commands.recv(), if !self.handles_dropped => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All recorder handles dropped; draining");
                        self.handles_dropped = true;
                        self.begin_closing();
                    }
                },

                Some((recording, record)) = inboxes.records.recv() => {
                    self.handle_captured_record(recording, record);
                }

                Some(response) = inboxes.responses.recv() => {
                    self.handle_worker_response(response);
                }

                Some(token) = inboxes.timers.recv() => {
                    self.handle_timer(token);
                }

                Some((attempt, availability)) = inboxes.workers.recv() => {
                    self.handle_worker_ready(attempt, availability);
                }

                Some(attempt) = inboxes.losses.recv() => {
                    self.handle_worker_lost(attempt);
                }
            }

            if self.try_finish_shutdown() {
                break;
            }
        }

        self.clear_worker();
        info!("Recorder task exiting");
    }

    fn handle_command(&mut self, command: RecorderCommand) {
        if self.closing
            && !matches!(
                command,
                RecorderCommand::Status(_)
                    | RecorderCommand::ReplayStats { .. }
                    | RecorderCommand::Shutdown(_)
            )
        {
            trace!("Recorder is shutting down, ignoring command");
            return;
        }

        match command {
            RecorderCommand::Start => {
                self.dispatch(RecorderEvent::Start);
                self.attempt_start();
            }
            RecorderCommand::Stop => self.dispatch(RecorderEvent::Stop),
            RecorderCommand::SessionRenewed => self.attempt_start(),
            RecorderCommand::SessionExpired => self.dispatch(RecorderEvent::Reset),
            RecorderCommand::DocumentInteractive => {
                if self.listening_interactive {
                    self.listening_interactive = false;
                    self.dispatch(RecorderEvent::DocumentInteractive);
                }
            }
            RecorderCommand::AddRecord(record) => self.add_record(record),
            RecorderCommand::PageEvent(event) => self.handle_page_event(event),
            RecorderCommand::Status(reply) => {
                let _ = reply.send(self.status);
            }
            RecorderCommand::ReplayStats { view_id, reply } => {
                let _ = reply.send(self.stats.lock().get(&view_id));
            }
            RecorderCommand::Shutdown(reply) => {
                self.shutdown.push(reply);
                self.begin_closing();
            }
        }
    }

    /// Run `event` and every event its effects produce
    fn dispatch(&mut self, event: RecorderEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let Some(Transition { next, effects }) = transition(self.status, event) else {
                trace!("Recorder ignored {:?} in {}", event, self.status.as_str());
                continue;
            };

            debug!(
                "Recorder {} -> {} on {:?}",
                self.status.as_str(),
                next.as_str(),
                event
            );
            self.status = next;

            for effect in effects {
                if let Some(follow_up) = self.apply(effect) {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    fn apply(&mut self, effect: Effect) -> Option<RecorderEvent> {
        match effect {
            Effect::SubscribeInteractive => {
                if self.deps.page.is_interactive() {
                    return Some(RecorderEvent::DocumentInteractive);
                }
                debug!("Waiting for the document to become interactive");
                self.listening_interactive = true;
                None
            }

            Effect::UnsubscribeInteractive => {
                self.listening_interactive = false;
                None
            }

            Effect::ClearWorker => {
                self.clear_worker();
                self.worker_attempt += 1;
                None
            }

            Effect::AcquireWorker => {
                let attempt = self.worker_attempt;
                let availability = self.deps.worker.request();
                let ready = self.worker_ready.clone();

                tokio::spawn(async move {
                    let availability = availability.await.unwrap_or_else(|_| {
                        Err(WorkerUnavailable::WorkerFailed(
                            "worker channel was reset".to_string(),
                        ))
                    });
                    let _ = ready.send((attempt, availability));
                });
                None
            }

            Effect::StartRecording => Some(self.start_recording()),

            Effect::StopRecording => {
                self.stop_recording();
                None
            }
        }
    }

    fn attempt_start(&mut self) {
        if self.status != RecorderStatus::IntendToStart {
            return;
        }

        let replay_allowed = self.deps.session.is_replay_allowed();
        let supported = self.deps.environment.is_recording_supported();
        if !replay_allowed || !supported {
            debug!(
                "Recording not started (replay allowed: {}, supported: {})",
                replay_allowed, supported
            );
        }

        self.dispatch(RecorderEvent::AttemptStart {
            eligible: replay_allowed && supported,
        });
    }

    fn handle_worker_ready(&mut self, attempt: u64, availability: WorkerAvailability) {
        if attempt != self.worker_attempt {
            trace!("Ignoring stale worker acquisition {}", attempt);
            return;
        }

        match availability {
            Ok(link) => {
                debug!("Compression worker acquired (version {})", link.version());
                self.watch_link(attempt, link.clone());
                self.link = Some(link);
                self.dispatch(RecorderEvent::WorkerAcquired);
            }
            Err(reason) => {
                warn!("Recording cannot start: {}", reason);
                self.dispatch(RecorderEvent::WorkerUnavailable);
            }
        }
    }

    fn watch_link(&mut self, attempt: u64, link: WorkerLink) {
        let lost = self.worker_lost.clone();
        if let Some(previous) = self.link_watch.replace(tokio::spawn(async move {
            link.lost().await;
            let _ = lost.send(attempt);
        })) {
            previous.abort();
        }
    }

    fn clear_worker(&mut self) {
        self.link = None;
        if let Some(watch) = self.link_watch.take() {
            watch.abort();
        }
    }

    fn handle_worker_lost(&mut self, attempt: u64) {
        if attempt != self.worker_attempt || self.link.is_none() {
            trace!("Ignoring loss of a worker from attempt {}", attempt);
            return;
        }

        // Streams may not have seen the broadcast yet; abort them the same way
        self.handle_worker_response(WorkerResponse::Errored {
            stream_id: None,
            message: "compression worker lost".to_string(),
        });
    }

    fn start_recording(&mut self) -> RecorderEvent {
        let Some(link) = self.link.clone() else {
            warn!("No compression worker to record with");
            return RecorderEvent::WorkerUnavailable;
        };

        let id = self.next_recording_id;
        self.next_recording_id += 1;

        let mut capture = match self
            .deps
            .capture
            .start(RecordSink::new(id, self.records.clone()))
        {
            Ok(capture) => capture,
            Err(e) => {
                self.deps
                    .diagnostics
                    .report(DiagnosticKind::CaptureFailed, e.to_string());
                return RecorderEvent::Stop;
            }
        };

        let mut collection = SegmentCollection::new(
            CollectionDeps {
                link,
                responses: self.responses.clone(),
                context: self.deps.context.clone(),
                transport: self.deps.transport.clone(),
                timer: self.timer.clone(),
                diagnostics: self.deps.diagnostics.clone(),
                stats: self.stats.clone(),
            },
            self.limits,
        );

        for record in capture.take_full_snapshot(now_ms()) {
            collection.add_record(record);
        }

        info!("Recording {} started", id);
        self.recording = Some(ActiveRecording {
            id,
            capture,
            collection,
        });
        RecorderEvent::RecordingStarted
    }

    fn stop_recording(&mut self) {
        let Some(mut recording) = self.recording.take() else {
            return;
        };

        recording.capture.stop();
        recording.collection.stop();
        info!("Recording {} stopped", recording.id);

        if !recording.collection.is_drained() {
            self.draining.push(recording.collection);
        }
    }

    fn add_record(&mut self, record: Record) {
        match self.recording.as_mut() {
            Some(recording) => recording.collection.add_record(record),
            None => {
                trace!("Not recording, dropping record");
                metrics::counter!(names::RECORDS_DROPPED, "reason" => "not_recording").increment(1);
            }
        }
    }

    fn handle_captured_record(&mut self, recording_id: RecordingId, record: Record) {
        match self.recording.as_mut() {
            Some(recording) if recording.id == recording_id => {
                recording.collection.add_record(record)
            }
            _ => {
                trace!("Dropping record from finished recording {}", recording_id);
                metrics::counter!(names::RECORDS_DROPPED, "reason" => "stale_recording").increment(1);
            }
        }
    }

    fn handle_page_event(&mut self, event: PageEvent) {
        let Some(recording) = self.recording.as_mut() else {
            trace!("Not recording, ignoring {:?}", event);
            return;
        };

        for record in recording.capture.flush_mutations() {
            recording.collection.add_record(record);
        }
        recording.collection.flush(Some(event.flush_reason()));

        if event == PageEvent::ViewChange {
            for record in recording.capture.take_full_snapshot(now_ms()) {
                recording.collection.add_record(record);
            }
        }
    }

    fn handle_worker_response(&mut self, response: WorkerResponse) {
        let worker_lost = matches!(response, WorkerResponse::Errored { stream_id: None, .. });

        if let Some(recording) = self.recording.as_mut() {
            recording.collection.handle_worker_response(response.clone());
        }
        for collection in &mut self.draining {
            collection.handle_worker_response(response.clone());
        }
        self.draining.retain(|collection| !collection.is_drained());

        if worker_lost && self.link.is_some() {
            warn!("Compression worker lost; stopping the recorder");
            self.clear_worker();
            self.dispatch(RecorderEvent::WorkerUnavailable);
        }
    }

    fn handle_timer(&mut self, token: TimerToken) {
        // Release the finished task
        self.timer.cancel(token);

        if let Some(recording) = self.recording.as_mut() {
            recording.collection.handle_timer(token);
        }
    }

    /// Stop for good; the task ends once every flushed segment is delivered
    fn begin_closing(&mut self) {
        self.closing = true;
        self.dispatch(RecorderEvent::Stop);
    }

    fn try_finish_shutdown(&mut self) -> bool {
        if !self.closing || self.recording.is_some() || !self.draining.is_empty() {
            return false;
        }

        for reply in self.shutdown.drain(..) {
            let _ = reply.send(());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::record::RecordType;
    use crate::testing::{
        full_document, record, CollectingSink, FakeCaptureFactory, FixedContext, Flag, ManualWorker,
        ManualWorkerFactory, RecordingTransport, SentPayload,
    };
    use crate::utils::config::WorkerConfig;
    use crate::worker::channel::WorkerFactory;
    use crate::worker::compressor::ThreadWorkerFactory;
    use crate::worker::protocol::{WorkerEndpoint, WorkerRequest};
    use tokio::time::{sleep, timeout};

    struct Fixture {
        handle: RecorderHandle,
        capture: Arc<FakeCaptureFactory>,
        session: Arc<Flag>,
        page: Arc<Flag>,
        transport: Arc<RecordingTransport>,
        sink: Arc<CollectingSink>,
    }

    fn fixture_with(factory: Arc<dyn WorkerFactory>) -> Fixture {
        let capture = Arc::new(FakeCaptureFactory::default());
        let session = Arc::new(Flag::new(true));
        let page = Arc::new(Flag::new(true));
        let transport = Arc::new(RecordingTransport::default());
        let sink = Arc::new(CollectingSink::default());
        let diagnostics = Diagnostics::new(sink.clone(), 10);

        let deps = RecorderDeps {
            capture: capture.clone(),
            session: session.clone(),
            environment: Arc::new(Flag::new(true)),
            page: page.clone(),
            context: Arc::new(FixedContext::new("view-1")),
            transport: transport.clone(),
            worker: WorkerChannel::new(factory, Duration::from_secs(5), diagnostics.clone()),
            diagnostics,
        };

        Fixture {
            handle: Recorder::new(deps, SegmentLimits::default()).spawn(),
            capture,
            session,
            page,
            transport,
            sink,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(ThreadWorkerFactory::new(WorkerConfig::default())))
    }

    async fn wait_for_status(handle: &RecorderHandle, expected: RecorderStatus) {
        let reached = timeout(Duration::from_secs(5), async {
            while handle.status().await.unwrap() != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "recorder never reached {:?}", expected);
    }

    async fn wait_for_payloads(transport: &RecordingTransport, count: usize) -> Vec<SentPayload> {
        let reached = timeout(Duration::from_secs(5), async {
            while transport.sent().len() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "expected {} payloads", count);
        transport.sent()
    }

    fn timestamps(sent: &[SentPayload]) -> Vec<i64> {
        sent.iter()
            .flat_map(|sent| {
                let document = full_document(&sent.payload.data, &sent.payload.pending_data);
                document["records"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|record| record["timestamp"].as_i64().unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_session_expiry_and_renewal() {
        let fixture = fixture();
        let handle = &fixture.handle;

        handle.start().unwrap();
        wait_for_status(handle, RecorderStatus::Started).await;
        assert_eq!(fixture.capture.started(), 1);

        fixture.session.set(false);
        handle.session_expired().unwrap();
        assert_eq!(handle.status().await.unwrap(), RecorderStatus::IntendToStart);
        assert_eq!(fixture.capture.stopped(), 1);

        // Guard fails: parked
        handle.session_renewed().unwrap();
        assert_eq!(handle.status().await.unwrap(), RecorderStatus::IntendToStart);

        fixture.session.set(true);
        handle.session_renewed().unwrap();
        wait_for_status(handle, RecorderStatus::Started).await;

        assert_eq!(fixture.capture.started(), 2);
        assert_eq!(fixture.capture.stopped(), 1);

        handle.shutdown().await.unwrap();
        assert_eq!(fixture.capture.stopped(), 2);
    }

    #[tokio::test]
    async fn test_waits_for_interactive_document() {
        let fixture = fixture();
        fixture.page.set(false);

        fixture.handle.start().unwrap();
        assert_eq!(
            fixture.handle.status().await.unwrap(),
            RecorderStatus::ListeningForInteractive
        );

        fixture.page.set(true);
        fixture.handle.document_interactive().unwrap();
        wait_for_status(&fixture.handle, RecorderStatus::Started).await;
    }

    #[tokio::test]
    async fn test_ineligible_session_never_starts() {
        let fixture = fixture();
        fixture.session.set(false);

        fixture.handle.start().unwrap();
        assert_eq!(
            fixture.handle.status().await.unwrap(),
            RecorderStatus::IntendToStart
        );
        assert_eq!(fixture.capture.started(), 0);

        fixture.handle.stop().unwrap();
        assert_eq!(fixture.handle.status().await.unwrap(), RecorderStatus::Stopped);
    }

    struct BlockedFactory;

    impl WorkerFactory for BlockedFactory {
        fn create(&self) -> std::result::Result<WorkerEndpoint, WorkerUnavailable> {
            Err(WorkerUnavailable::CreationBlocked("denied".into()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_worker_stops_recorder() {
        let fixture = fixture_with(Arc::new(BlockedFactory));

        fixture.handle.start().unwrap();
        wait_for_status(&fixture.handle, RecorderStatus::Stopped).await;

        assert_eq!(fixture.capture.started(), 0);
        let kinds: Vec<_> = fixture.sink.events().iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::WorkerUnavailable]);
    }

    #[tokio::test]
    async fn test_capture_failure_stops_recorder() {
        let fixture = fixture();
        fixture.capture.set_failing(true);

        fixture.handle.start().unwrap();
        wait_for_status(&fixture.handle, RecorderStatus::Stopped).await;

        let kinds: Vec<_> = fixture.sink.events().iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::CaptureFailed]);
    }

    #[tokio::test]
    async fn test_view_change_flushes_then_snapshots() {
        let fixture = fixture();
        let handle = &fixture.handle;
        handle.start().unwrap();
        wait_for_status(handle, RecorderStatus::Started).await;

        fixture.capture.queue_mutation(record(1));
        handle.page_event(PageEvent::ViewChange).unwrap();

        let sent = wait_for_payloads(&fixture.transport, 1).await;
        let payload = &sent[0].payload;
        assert_eq!(payload.flush_reason, CreationReason::ViewChange);
        assert_eq!(payload.metadata.segment.creation_reason, CreationReason::Init);
        assert_eq!(payload.metadata.segment.records_count, 2);
        assert!(payload.metadata.segment.has_full_snapshot);
        assert!(timestamps(&sent).contains(&1));

        let stats = handle.replay_stats("view-1").await.unwrap().unwrap();
        assert_eq!(stats.segments_count, 2);
        assert_eq!(stats.records_count, 3);

        // Page exit completes without waiting for the worker
        handle.page_event(PageEvent::BeforeUnload).unwrap();
        handle.status().await.unwrap();

        let sent = fixture.transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].on_exit);
        let segment = &sent[1].payload.metadata.segment;
        assert_eq!(segment.creation_reason, CreationReason::ViewChange);
        assert_eq!(segment.index_in_view, 1);
        assert_eq!(segment.records_count, 1);
        let document = full_document(&sent[1].payload.data, &sent[1].payload.pending_data);
        assert_eq!(document["records"][0]["type"], RecordType::FullSnapshot.as_u8());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_delivers_pending_segment() {
        let fixture = fixture();
        fixture.handle.start().unwrap();
        wait_for_status(&fixture.handle, RecorderStatus::Started).await;

        fixture.handle.add_record(record(7)).unwrap();
        fixture.handle.shutdown().await.unwrap();

        let sent = fixture.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.flush_reason, CreationReason::SdkStopped);
        assert_eq!(sent[0].payload.metadata.segment.records_count, 2);
        assert!(fixture.handle.status().await.is_err());
    }

    #[tokio::test]
    async fn test_records_from_previous_recording_are_dropped() {
        let fixture = fixture();
        let handle = &fixture.handle;
        handle.start().unwrap();
        wait_for_status(handle, RecorderStatus::Started).await;
        let first_sink = fixture.capture.last_sink().unwrap();

        handle.session_expired().unwrap();
        handle.session_renewed().unwrap();
        wait_for_status(handle, RecorderStatus::Started).await;
        let second_sink = fixture.capture.last_sink().unwrap();
        assert_ne!(first_sink.recording_id(), second_sink.recording_id());

        assert!(first_sink.add_record(record(42)));
        assert!(second_sink.add_record(record(43)));
        handle.shutdown().await.unwrap();

        let timestamps = timestamps(&fixture.transport.sent());
        assert!(timestamps.contains(&43));
        assert!(!timestamps.contains(&42));
    }

    /// Answer the handshake of the worker the recorder asked for
    async fn initialized_worker(factory: &ManualWorkerFactory) -> ManualWorker {
        let worker = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(worker) = factory.take_worker() {
                    return worker;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(worker.next_request(), Some(WorkerRequest::Init));
        worker.send(WorkerResponse::Initialized {
            version: "test".into(),
        });
        worker
    }

    #[tokio::test]
    async fn test_worker_loss_stops_recording() {
        let factory = Arc::new(ManualWorkerFactory::default());
        let fixture = fixture_with(factory.clone());
        fixture.handle.start().unwrap();

        let worker = initialized_worker(&factory).await;
        wait_for_status(&fixture.handle, RecorderStatus::Started).await;

        worker.crash("out of memory");
        wait_for_status(&fixture.handle, RecorderStatus::Stopped).await;

        let sent = wait_for_payloads(&fixture.transport, 1).await;
        assert_eq!(sent[0].payload.flush_reason, CreationReason::StreamAborted);
        assert!(!sent[0].payload.is_complete());
        assert_eq!(fixture.capture.stopped(), 1);
    }

    #[tokio::test]
    async fn test_worker_loss_between_segments_stops_recorder() {
        let factory = Arc::new(ManualWorkerFactory::default());
        let fixture = fixture_with(factory.clone());
        let handle = &fixture.handle;
        handle.start().unwrap();

        let worker = initialized_worker(&factory).await;
        wait_for_status(handle, RecorderStatus::Started).await;

        // Page exit completes synchronously and leaves no stream open
        handle.page_event(PageEvent::BeforeUnload).unwrap();
        handle.status().await.unwrap();
        assert_eq!(fixture.transport.sent().len(), 1);

        drop(worker);
        wait_for_status(handle, RecorderStatus::Stopped).await;
        assert_eq!(fixture.capture.stopped(), 1);

        handle.add_record(record(5)).unwrap();
        handle.page_event(PageEvent::VisibilityHidden).unwrap();
        timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown waited on a dead worker")
            .unwrap();

        assert_eq!(fixture.transport.sent().len(), 1);
        let kinds: Vec<_> = fixture.sink.events().iter().map(|event| event.kind).collect();
        assert_eq!(kinds, vec![DiagnosticKind::WorkerUnavailable]);
    }

    #[tokio::test]
    async fn test_dropping_every_handle_drains_segments() {
        let Fixture {
            handle, transport, ..
        } = fixture();
        handle.start().unwrap();
        wait_for_status(&handle, RecorderStatus::Started).await;

        handle.add_record(record(9)).unwrap();
        drop(handle);

        let sent = wait_for_payloads(&transport, 1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.flush_reason, CreationReason::SdkStopped);
        assert!(timestamps(&sent).contains(&9));
    }
}
