// packages/replay/src/worker/channel.rs
//! Shared connection to the compression worker
//!
//! One `WorkerChannel` (and its clones) owns at most one worker. Callers that
//! ask for it while it is starting are coalesced onto the same construction
//! attempt; once the channel has either initialized or failed, the outcome
//! is final and answered immediately.
//!
//! ```text
//! Nil ──request──► Loading ──handshake ok──► Initialized
//!                     │                          │
//!                     └─timeout / error──► Error ◄┘ worker lost
//! ```

use crate::observability::{DiagnosticKind, Diagnostics};
use crate::utils::errors::WorkerUnavailable;
use crate::worker::protocol::{
    StreamId, WorkerEndpoint, WorkerEvent, WorkerRequest, WorkerResponse,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Outcome delivered to every caller of [`WorkerChannel::request`]
pub type WorkerAvailability = Result<WorkerLink, WorkerUnavailable>;

/// Creates workers; the only environment-specific primitive
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Result<WorkerEndpoint, WorkerUnavailable>;
}

/// Observable channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Nil,
    Loading,
    Error,
    Initialized,
}

enum ChannelState {
    Nil,
    Loading {
        waiters: Vec<oneshot::Sender<WorkerAvailability>>,
    },
    Error(WorkerUnavailable),
    Initialized(WorkerLink),
}

struct Shared {
    state: Mutex<ChannelState>,
    /// Bumped by `reset`; guarded by `state`'s lock
    generation: Mutex<u64>,
    factory: Arc<dyn WorkerFactory>,
    handshake_timeout: Duration,
    diagnostics: Diagnostics,
}

/// Process-wide handle on the compression worker
#[derive(Clone)]
pub struct WorkerChannel {
    shared: Arc<Shared>,
}

impl WorkerChannel {
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        handshake_timeout: Duration,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState::Nil),
                generation: Mutex::new(0),
                factory,
                handshake_timeout,
                diagnostics,
            }),
        }
    }

    /// Ask for the worker
    ///
    /// The answer always travels through the returned receiver, so it is
    /// observed on the caller's next poll and never re-enters the caller.
    /// Starting a worker needs a Tokio runtime for the handshake task.
    pub fn request(&self) -> oneshot::Receiver<WorkerAvailability> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.state.lock();

        if matches!(*state, ChannelState::Nil) {
            *state = ChannelState::Loading { waiters: vec![tx] };
            let generation = *self.shared.generation.lock();
            drop(state);

            debug!("Creating compression worker");
            self.start_loading(generation);
            return rx;
        }

        match &mut *state {
            ChannelState::Loading { waiters } => waiters.push(tx),
            ChannelState::Error(reason) => {
                let _ = tx.send(Err(reason.clone()));
            }
            ChannelState::Initialized(link) => {
                let _ = tx.send(Ok(link.clone()));
            }
            // Handled above
            ChannelState::Nil => {}
        }

        rx
    }

    /// Wait for the worker
    pub async fn acquire(&self) -> WorkerAvailability {
        self.request().await.unwrap_or_else(|_| {
            Err(WorkerUnavailable::WorkerFailed(
                "worker channel was reset".to_string(),
            ))
        })
    }

    pub fn status(&self) -> ChannelStatus {
        match &*self.shared.state.lock() {
            ChannelState::Nil => ChannelStatus::Nil,
            ChannelState::Loading { .. } => ChannelStatus::Loading,
            ChannelState::Error(_) => ChannelStatus::Error,
            ChannelState::Initialized(_) => ChannelStatus::Initialized,
        }
    }

    /// Forget the current worker and return to `Nil`
    ///
    /// Pending waiters are dropped and any in-flight handshake is ignored.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        *self.shared.generation.lock() += 1;
        *state = ChannelState::Nil;
    }

    fn start_loading(&self, generation: u64) {
        let endpoint = match self.shared.factory.create() {
            Ok(endpoint) => endpoint,
            Err(reason) => {
                self.fail(generation, reason);
                return;
            }
        };

        let WorkerEndpoint { requests, events } = endpoint;

        if requests.send(WorkerRequest::Init).is_err() {
            self.fail(
                generation,
                WorkerUnavailable::WorkerFailed("worker inbox closed before handshake".to_string()),
            );
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.fail(
                    generation,
                    WorkerUnavailable::CreationFailed(format!("no async runtime: {}", e)),
                );
                return;
            }
        };

        let channel = self.clone();
        runtime.spawn(async move {
            channel.run_worker_events(generation, requests, events).await;
        });
    }

    async fn run_worker_events(
        self,
        generation: u64,
        requests: crossbeam_channel::Sender<WorkerRequest>,
        mut events: UnboundedReceiver<WorkerEvent>,
    ) {
        let timeout = self.shared.handshake_timeout;

        let version = match tokio::time::timeout(timeout, wait_for_handshake(&mut events)).await {
            Ok(Ok(version)) => version,
            Ok(Err(reason)) => {
                self.fail(generation, reason);
                return;
            }
            Err(_) => {
                self.fail(generation, WorkerUnavailable::HandshakeTimeout(timeout));
                return;
            }
        };

        let link = WorkerLink::new(requests, version);
        if !self.initialize(generation, link.clone()) {
            return;
        }

        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Message(WorkerResponse::Errored { stream_id: None, message })
                | WorkerEvent::Crashed(message) => {
                    self.lose(generation, &link, message);
                    return;
                }
                WorkerEvent::Message(response) => link.dispatch(response),
            }
        }

        self.lose(generation, &link, "worker event stream closed".to_string());
    }

    fn initialize(&self, generation: u64, link: WorkerLink) -> bool {
        let mut state = self.shared.state.lock();
        if *self.shared.generation.lock() != generation {
            return false;
        }

        let previous = std::mem::replace(&mut *state, ChannelState::Initialized(link.clone()));
        drop(state);

        info!("Compression worker initialized (version {})", link.version());

        if let ChannelState::Loading { waiters } = previous {
            for waiter in waiters {
                let _ = waiter.send(Ok(link.clone()));
            }
        }
        true
    }

    fn fail(&self, generation: u64, reason: WorkerUnavailable) {
        let mut state = self.shared.state.lock();
        if *self.shared.generation.lock() != generation {
            return;
        }

        let previous = std::mem::replace(&mut *state, ChannelState::Error(reason.clone()));
        drop(state);

        warn!("Compression worker unavailable: {}", reason);
        self.shared.diagnostics.report(
            DiagnosticKind::WorkerUnavailable,
            format!("{} ({})", reason, reason.as_str()),
        );

        if let ChannelState::Loading { waiters } = previous {
            for waiter in waiters {
                let _ = waiter.send(Err(reason.clone()));
            }
        }
    }

    fn lose(&self, generation: u64, link: &WorkerLink, message: String) {
        self.fail(generation, WorkerUnavailable::WorkerFailed(message.clone()));
        link.mark_lost();
        link.broadcast_failure(&message);
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("status", &self.status())
            .finish()
    }
}

async fn wait_for_handshake(
    events: &mut UnboundedReceiver<WorkerEvent>,
) -> Result<String, WorkerUnavailable> {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(WorkerResponse::Initialized { version }) => return Ok(version),
            WorkerEvent::Message(WorkerResponse::Errored { message, .. })
            | WorkerEvent::Crashed(message) => {
                return Err(WorkerUnavailable::WorkerFailed(message));
            }
            WorkerEvent::Message(other) => {
                trace!("Ignoring worker message before handshake: {:?}", other);
            }
        }
    }

    Err(WorkerUnavailable::WorkerFailed(
        "worker exited during handshake".to_string(),
    ))
}

struct LinkInner {
    requests: crossbeam_channel::Sender<WorkerRequest>,
    version: String,
    routes: DashMap<StreamId, UnboundedSender<WorkerResponse>>,
    next_stream_id: AtomicU32,
    /// Flips to `true` once, when the worker goes away
    lost: watch::Sender<bool>,
}

/// Handle on an initialized worker, shared by every stream
///
/// Once the worker is lost every stream on the link, including streams
/// opened afterwards, receives an `Errored` response through its route.
#[derive(Clone)]
pub struct WorkerLink {
    inner: Arc<LinkInner>,
}

impl WorkerLink {
    pub fn new(requests: crossbeam_channel::Sender<WorkerRequest>, version: impl Into<String>) -> Self {
        let (lost, _) = watch::channel(false);

        Self {
            inner: Arc::new(LinkInner {
                requests,
                version: version.into(),
                routes: DashMap::new(),
                next_stream_id: AtomicU32::new(0),
                lost,
            }),
        }
    }

    /// Build version reported by the worker
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn is_lost(&self) -> bool {
        *self.inner.lost.borrow()
    }

    /// Resolves once the worker is gone
    pub async fn lost(&self) {
        let mut lost = self.inner.lost.subscribe();
        while !*lost.borrow_and_update() {
            if lost.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fire-and-forget send; `false` if the worker is gone
    ///
    /// A request that cannot be delivered is answered with `Errored` on its
    /// stream's route, so the stream never waits for it.
    pub fn post(&self, request: WorkerRequest) -> bool {
        let stream_id = request.stream_id();
        if !self.is_lost() && self.inner.requests.send(request).is_ok() {
            return true;
        }

        self.mark_lost();
        if let Some(stream_id) = stream_id {
            self.notify_lost(stream_id, "compression worker is gone");
        }
        false
    }

    /// Allocate a stream id and route its responses to `responses`
    pub fn open_stream(&self, responses: UnboundedSender<WorkerResponse>) -> StreamId {
        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.inner.routes.insert(stream_id, responses);

        // Checked after the route exists so a concurrent `broadcast_failure`
        // cannot miss this stream
        if self.is_lost() {
            self.notify_lost(stream_id, "stream opened after the compression worker was lost");
        }
        stream_id
    }

    /// Stop routing responses for `stream_id`
    pub fn close_stream(&self, stream_id: StreamId) {
        self.inner.routes.remove(&stream_id);
    }

    pub fn open_streams(&self) -> usize {
        self.inner.routes.len()
    }

    pub(crate) fn dispatch(&self, response: WorkerResponse) {
        let Some(stream_id) = response.stream_id() else {
            trace!("Dropping unroutable worker response: {:?}", response);
            return;
        };

        match self.inner.routes.get(&stream_id) {
            Some(route) => {
                let _ = route.value().send(response);
            }
            None => trace!("Dropping response for closed stream {}", stream_id),
        }
    }

    fn mark_lost(&self) {
        if !self.inner.lost.send_replace(true) {
            debug!("Worker link marked lost ({} open streams)", self.open_streams());
        }
    }

    fn notify_lost(&self, stream_id: StreamId, message: &str) {
        if let Some(route) = self.inner.routes.get(&stream_id) {
            let _ = route.value().send(WorkerResponse::Errored {
                stream_id: Some(stream_id),
                message: message.to_string(),
            });
        }
    }

    fn broadcast_failure(&self, message: &str) {
        for route in self.inner.routes.iter() {
            let _ = route.value().send(WorkerResponse::Errored {
                stream_id: None,
                message: message.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for WorkerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLink")
            .field("version", &self.inner.version)
            .field("open_streams", &self.open_streams())
            .finish()
    }
}
