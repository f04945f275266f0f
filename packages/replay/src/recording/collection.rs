// packages/replay/src/recording/collection.rs
//! Segment lifecycle: at most one open segment, flushed on size, age or
//! external triggers
//!
//! ```text
//!            add_record                     flush(reason)
//! Waiting ─────────────────> SegmentPending ─────────────> Waiting(reason)
//!    ^                            │   │ flush(None)
//!    └──── stream aborted ────────┘   └────────────────> Stopped (terminal)
//! ```
//!
//! Flushed segments that still wait for the worker live in `finishing` until
//! their stream completes.

use crate::observability::{names, DiagnosticKind, Diagnostics};
use crate::recording::encoder::StreamEncoder;
use crate::recording::payload::{SegmentPayload, SegmentTransport};
use crate::recording::record::Record;
use crate::recording::segment::{
    CreationReason, FlushProgress, FlushReason, FlushedSegment, Segment, SegmentContext,
    SegmentEvent, SegmentMetadata,
};
use crate::recording::stats::ReplayStats;
use crate::utils::config::SegmentConfig;
use crate::worker::channel::WorkerLink;
use crate::worker::protocol::WorkerResponse;
use parking_lot::{Mutex, MutexGuard};
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace};

/// Handle for a scheduled duration flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// Schedules duration flushes; expiry is fed back through
/// [`SegmentCollection::handle_timer`]
pub trait SegmentTimer: Send + Sync {
    fn schedule(&self, delay: Duration) -> TimerToken;
    fn cancel(&self, token: TimerToken);
}

/// Supplies the identifiers of the current view
pub trait ContextProvider: Send + Sync {
    fn compute_context(&self) -> Option<SegmentContext>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLimits {
    /// Compressed size above which the segment is flushed
    pub max_size_bytes: usize,
    pub max_duration: Duration,
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self::from(&SegmentConfig::default())
    }
}

impl From<&SegmentConfig> for SegmentLimits {
    fn from(config: &SegmentConfig) -> Self {
        Self {
            max_size_bytes: config.max_size_bytes,
            max_duration: config.max_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    WaitingForInitialRecord(CreationReason),
    SegmentPending,
    Stopped,
}

enum CollectionState {
    WaitingForInitialRecord { next_reason: CreationReason },
    SegmentPending { segment: Segment, timer: TimerToken },
    Stopped,
}

/// Everything a collection talks to
pub struct CollectionDeps {
    pub link: WorkerLink,
    /// Where this collection's streams deliver worker responses
    pub responses: UnboundedSender<WorkerResponse>,
    pub context: Arc<dyn ContextProvider>,
    pub transport: Arc<dyn SegmentTransport>,
    pub timer: Arc<dyn SegmentTimer>,
    pub diagnostics: Diagnostics,
    /// Shared with later collections so segment indexes keep counting per view
    pub stats: Arc<Mutex<ReplayStats>>,
}

pub struct SegmentCollection {
    state: CollectionState,
    finishing: Vec<Segment>,
    deps: CollectionDeps,
    limits: SegmentLimits,
}

impl SegmentCollection {
    pub fn new(deps: CollectionDeps, limits: SegmentLimits) -> Self {
        Self {
            state: CollectionState::WaitingForInitialRecord {
                next_reason: CreationReason::Init,
            },
            finishing: Vec::new(),
            deps,
            limits,
        }
    }

    pub fn status(&self) -> CollectionStatus {
        match &self.state {
            CollectionState::WaitingForInitialRecord { next_reason } => {
                CollectionStatus::WaitingForInitialRecord(*next_reason)
            }
            CollectionState::SegmentPending { .. } => CollectionStatus::SegmentPending,
            CollectionState::Stopped => CollectionStatus::Stopped,
        }
    }

    /// Metadata of the open segment
    pub fn current_segment(&self) -> Option<&SegmentMetadata> {
        match &self.state {
            CollectionState::SegmentPending { segment, .. } => Some(segment.metadata()),
            _ => None,
        }
    }

    /// Flushed segments still waiting for the worker
    pub fn finishing_segments(&self) -> usize {
        self.finishing.len()
    }

    /// Stopped with nothing left to deliver
    pub fn is_drained(&self) -> bool {
        matches!(self.state, CollectionState::Stopped) && self.finishing.is_empty()
    }

    /// Segments that still accept records; never more than one
    pub fn unflushed_segments(&self) -> usize {
        let pending = match &self.state {
            CollectionState::SegmentPending { segment, .. } if !segment.is_flushed() => 1,
            _ => 0,
        };
        pending + self.finishing.iter().filter(|segment| !segment.is_flushed()).count()
    }

    pub fn stats(&self) -> MutexGuard<'_, ReplayStats> {
        self.deps.stats.lock()
    }

    pub fn add_record(&mut self, record: Record) {
        let next_reason = match &mut self.state {
            CollectionState::Stopped => {
                trace!("Collection stopped, dropping record");
                metrics::counter!(names::RECORDS_DROPPED, "reason" => "stopped").increment(1);
                return;
            }

            CollectionState::SegmentPending { segment, .. } => {
                match segment.add_record(&record) {
                    Ok(()) => {
                        self.deps.stats.lock().add_record(segment.view_id());
                        metrics::counter!(names::RECORDS_ACCEPTED).increment(1);
                    }
                    Err(e) => {
                        self.deps
                            .diagnostics
                            .report(DiagnosticKind::SerializationFailed, e.to_string());
                        metrics::counter!(names::RECORDS_DROPPED, "reason" => "serialization")
                            .increment(1);
                    }
                }
                return;
            }

            CollectionState::WaitingForInitialRecord { next_reason } => *next_reason,
        };

        self.start_segment(next_reason, record);
    }

    /// Flush the open segment
    ///
    /// With a reason the next record opens a new segment created for that
    /// reason; without one the collection stops for good.
    pub fn flush(&mut self, next_reason: Option<FlushReason>) {
        let next_state = match (&self.state, next_reason) {
            (CollectionState::Stopped, _) => return,
            (_, Some(reason)) => CollectionState::WaitingForInitialRecord {
                next_reason: reason,
            },
            (_, None) => CollectionState::Stopped,
        };

        let previous = mem::replace(&mut self.state, next_state);
        if let CollectionState::SegmentPending { mut segment, timer } = previous {
            self.deps.timer.cancel(timer);

            let reason = next_reason.unwrap_or(CreationReason::SdkStopped);
            match segment.flush(reason) {
                FlushProgress::Complete(flushed) => self.deliver(flushed),
                FlushProgress::Pending => self.finishing.push(segment),
                FlushProgress::Ignored => {}
            }
        }
    }

    pub fn stop(&mut self) {
        self.flush(None)
    }

    /// A duration timer fired; stale tokens are ignored
    pub fn handle_timer(&mut self, token: TimerToken) {
        let current = matches!(
            &self.state,
            CollectionState::SegmentPending { timer, .. } if *timer == token
        );

        if current {
            self.flush(Some(CreationReason::MaxDuration));
        } else {
            trace!("Ignoring stale segment timer {:?}", token);
        }
    }

    /// Route a worker response to the segment owning its stream; broadcast
    /// responses reach every segment
    pub fn handle_worker_response(&mut self, response: WorkerResponse) {
        let target = response.stream_id();

        // Finishing segments first: a segment flushed below must not see the
        // same response twice
        let mut index = 0;
        while index < self.finishing.len() {
            let segment = &mut self.finishing[index];
            let event = if target.map_or(true, |id| id == segment.stream_id()) {
                segment.handle_response(response.clone())
            } else {
                None
            };

            match event {
                Some(SegmentEvent::Flushed(flushed)) | Some(SegmentEvent::Aborted(flushed)) => {
                    self.finishing.remove(index);
                    self.deliver(flushed);
                }
                Some(SegmentEvent::SizeUpdated {
                    additional_raw_bytes,
                    ..
                }) => {
                    let view_id = self.finishing[index].view_id().to_string();
                    self.deps.stats.lock().add_wrote_data(&view_id, additional_raw_bytes);
                    index += 1;
                }
                None => index += 1,
            }
        }

        let event = match &mut self.state {
            CollectionState::SegmentPending { segment, .. }
                if target.map_or(true, |id| id == segment.stream_id()) =>
            {
                let view_id = segment.view_id().to_string();
                segment.handle_response(response).map(|event| (view_id, event))
            }
            _ => None,
        };

        match event {
            Some((view_id, SegmentEvent::SizeUpdated { compressed_bytes, additional_raw_bytes })) => {
                self.deps.stats.lock().add_wrote_data(&view_id, additional_raw_bytes);
                if compressed_bytes > self.limits.max_size_bytes {
                    self.flush(Some(CreationReason::MaxSize));
                }
            }
            Some((_, SegmentEvent::Flushed(flushed))) | Some((_, SegmentEvent::Aborted(flushed))) => {
                let previous = mem::replace(
                    &mut self.state,
                    CollectionState::WaitingForInitialRecord {
                        next_reason: CreationReason::StreamAborted,
                    },
                );
                if let CollectionState::SegmentPending { timer, .. } = previous {
                    self.deps.timer.cancel(timer);
                }
                self.deliver(flushed);
            }
            None => {}
        }
    }

    fn start_segment(&mut self, reason: CreationReason, record: Record) {
        let Some(context) = self.deps.context.compute_context() else {
            trace!("No segment context, dropping record");
            metrics::counter!(names::RECORDS_DROPPED, "reason" => "no_context").increment(1);
            return;
        };

        let view_id = context.view_id.clone();
        let encoder = StreamEncoder::new(
            self.deps.link.clone(),
            self.deps.responses.clone(),
            self.deps.diagnostics.clone(),
        );
        let index_in_view = self.deps.stats.lock().segments_count(&view_id);

        match Segment::new(encoder, context, reason, index_in_view, &record) {
            Ok(segment) => {
                self.deps.stats.lock().add_segment(&view_id);
                self.deps.stats.lock().add_record(&view_id);
                metrics::counter!(names::RECORDS_ACCEPTED).increment(1);

                let timer = self.deps.timer.schedule(self.limits.max_duration);
                debug!(
                    "Started segment {} of view {} (reason {})",
                    index_in_view,
                    view_id,
                    reason.as_str()
                );
                self.state = CollectionState::SegmentPending { segment, timer };
            }
            Err(e) => {
                self.deps
                    .diagnostics
                    .report(DiagnosticKind::SerializationFailed, e.to_string());
                metrics::counter!(names::RECORDS_DROPPED, "reason" => "serialization").increment(1);
            }
        }
    }

    fn deliver(&self, flushed: FlushedSegment) {
        let payload = SegmentPayload::from(flushed);
        let reason = payload.flush_reason.as_str();

        info!(
            view = %payload.metadata.segment.view.id,
            records = payload.metadata.segment.records_count,
            compressed = payload.metadata.compressed_segment_size,
            "Segment flushed ({})",
            reason
        );
        metrics::counter!(names::SEGMENTS_FLUSHED, "reason" => reason).increment(1);
        metrics::histogram!(names::SEGMENT_COMPRESSED_BYTES)
            .record(payload.metadata.compressed_segment_size as f64);
        metrics::histogram!(names::SEGMENT_RAW_BYTES).record(payload.metadata.raw_segment_size as f64);

        if payload.flush_reason.is_page_exit() {
            self.deps.transport.send_on_exit(payload);
        } else {
            self.deps.transport.send(payload);
        }
    }
}
