// packages/replay/src/recorder/collaborators.rs
//! Interfaces the recorder consumes from the host

use crate::recording::record::Record;
use crate::utils::errors::Result;
use tokio::sync::mpsc::UnboundedSender;

pub use crate::recording::collection::ContextProvider;
pub use crate::recording::payload::SegmentTransport;
pub use crate::worker::channel::WorkerFactory;

/// Identifies one started recording
pub type RecordingId = u64;

/// Where a capture session pushes records
///
/// Records are tagged with the recording that created the sink; once that
/// recording stops they are dropped.
#[derive(Debug, Clone)]
pub struct RecordSink {
    recording: RecordingId,
    records: UnboundedSender<(RecordingId, Record)>,
}

impl RecordSink {
    pub(crate) fn new(recording: RecordingId, records: UnboundedSender<(RecordingId, Record)>) -> Self {
        Self { recording, records }
    }

    pub fn recording_id(&self) -> RecordingId {
        self.recording
    }

    /// `false` once the recorder is gone
    pub fn add_record(&self, record: Record) -> bool {
        self.records.send((self.recording, record)).is_ok()
    }
}

/// Starts page capture
pub trait CaptureFactory: Send + Sync {
    fn start(&self, sink: RecordSink) -> Result<Box<dyn CaptureSession>>;
}

/// A running capture
///
/// The hooks return records synchronously so they land in the segment being
/// flushed (mutations) or the one that follows (snapshots).
pub trait CaptureSession: Send {
    /// Records for mutations observed but not yet emitted
    fn flush_mutations(&mut self) -> Vec<Record>;

    fn take_full_snapshot(&mut self, timestamp: i64) -> Vec<Record>;

    fn stop(&mut self);
}

pub trait SessionProvider: Send + Sync {
    /// A session is tracked and sampled for replay
    fn is_replay_allowed(&self) -> bool;
}

pub trait EnvironmentProbe: Send + Sync {
    fn is_recording_supported(&self) -> bool;
}

pub trait PageReadiness: Send + Sync {
    fn is_interactive(&self) -> bool;
}

/// Environment that can always record
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSupported;

impl EnvironmentProbe for AlwaysSupported {
    fn is_recording_supported(&self) -> bool {
        true
    }
}

impl PageReadiness for AlwaysSupported {
    fn is_interactive(&self) -> bool {
        true
    }
}
