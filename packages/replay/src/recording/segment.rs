// packages/replay/src/recording/segment.rs
//! A bounded batch of records compressed as one payload
//!
//! The segment streams a single JSON document through its encoder:
//!
//! ```text
//! {"records":[<r1>   ,<r2>   ,<r3>   ],<metadata fields>}\n
//! └─ first write ─┘ └─ add ─┘ └ add ┘ └──── flush suffix ────┘
//! ```

use crate::recording::encoder::{EncoderOutput, EncoderResult, StreamEncoder};
use crate::recording::record::Record;
use crate::utils::errors::{ReplayError, Result};
use crate::worker::protocol::{StreamId, WorkerResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Identifiers a segment is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentContext {
    pub application_id: String,
    pub session_id: String,
    pub view_id: String,
}

/// Why a segment was started (or, equivalently, why the previous one ended)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationReason {
    Init,
    ViewChange,
    BeforeUnload,
    PageExit,
    VisibilityHidden,
    MaxSize,
    MaxDuration,
    SdkStopped,
    StreamAborted,
}

/// Flush reasons share the creation reason vocabulary
pub type FlushReason = CreationReason;

impl CreationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationReason::Init => "init",
            CreationReason::ViewChange => "view_change",
            CreationReason::BeforeUnload => "before_unload",
            CreationReason::PageExit => "page_exit",
            CreationReason::VisibilityHidden => "visibility_hidden",
            CreationReason::MaxSize => "max_size",
            CreationReason::MaxDuration => "max_duration",
            CreationReason::SdkStopped => "sdk_stopped",
            CreationReason::StreamAborted => "stream_aborted",
        }
    }

    /// The page is going away; there is no time for a worker round trip
    pub fn is_page_exit(&self) -> bool {
        matches!(self, CreationReason::BeforeUnload | CreationReason::PageExit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRef {
    pub id: String,
}

/// Metadata appended to the segment document and sent alongside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentMetadata {
    pub application: IdRef,
    pub session: IdRef,
    pub view: IdRef,
    pub start: i64,
    pub end: i64,
    pub records_count: u32,
    pub creation_reason: CreationReason,
    pub has_full_snapshot: bool,
    pub index_in_view: u32,
    pub source: &'static str,
}

/// A segment whose encoder output is final
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedSegment {
    pub metadata: SegmentMetadata,
    pub result: EncoderResult,
    pub reason: FlushReason,
}

/// Result of asking a segment to flush
#[derive(Debug)]
pub enum FlushProgress {
    /// Already flushed; nothing happened
    Ignored,
    /// Waiting for the worker to finish the stream
    Pending,
    /// Finished synchronously
    Complete(FlushedSegment),
}

/// What a worker response meant for the segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    SizeUpdated {
        compressed_bytes: usize,
        additional_raw_bytes: usize,
    },
    Flushed(FlushedSegment),
    /// The stream died; the segment completed with partial data
    Aborted(FlushedSegment),
}

pub struct Segment {
    metadata: SegmentMetadata,
    encoder: StreamEncoder,
    flushed: bool,
    flush_reason: Option<FlushReason>,
    /// Closing text that never reached the encoder
    unwritten_suffix: Option<String>,
}

impl Segment {
    /// Create a segment holding `initial_record`
    pub fn new(
        encoder: StreamEncoder,
        context: SegmentContext,
        creation_reason: CreationReason,
        index_in_view: u32,
        initial_record: &Record,
    ) -> Result<Self> {
        let mut segment = Self {
            metadata: SegmentMetadata {
                application: IdRef {
                    id: context.application_id,
                },
                session: IdRef {
                    id: context.session_id,
                },
                view: IdRef {
                    id: context.view_id,
                },
                start: initial_record.timestamp,
                end: initial_record.timestamp,
                records_count: 0,
                creation_reason,
                has_full_snapshot: false,
                index_in_view,
                source: "browser",
            },
            encoder,
            flushed: false,
            flush_reason: None,
            unwritten_suffix: None,
        };

        segment.add_record(initial_record)?;
        Ok(segment)
    }

    pub fn add_record(&mut self, record: &Record) -> Result<()> {
        if self.flushed {
            return Err(ReplayError::RecordingFailed(
                "Segment already flushed".to_string(),
            ));
        }

        let json = serde_json::to_string(record).map_err(|e| {
            ReplayError::SerializationFailed(format!("Record serialization error: {}", e))
        })?;

        let prefix = if self.metadata.records_count == 0 {
            "{\"records\":["
        } else {
            ","
        };

        self.metadata.start = self.metadata.start.min(record.timestamp);
        self.metadata.end = self.metadata.end.max(record.timestamp);
        self.metadata.records_count += 1;
        self.metadata.has_full_snapshot |= record.is_full_snapshot();

        self.encoder.write(format!("{}{}", prefix, json));
        Ok(())
    }

    /// Close the segment; only the first call has an effect
    pub fn flush(&mut self, reason: FlushReason) -> FlushProgress {
        if self.flushed {
            return FlushProgress::Ignored;
        }
        self.flushed = true;
        self.flush_reason = Some(reason);

        let suffix = self.suffix();
        if self.encoder.write(suffix.clone()).is_none() {
            self.unwritten_suffix = Some(suffix);
        }

        if reason.is_page_exit() || self.unwritten_suffix.is_some() {
            return FlushProgress::Complete(self.complete_sync());
        }

        self.encoder.finish();
        debug!(
            "Flushing segment ({} records, reason {})",
            self.metadata.records_count,
            reason.as_str()
        );
        FlushProgress::Pending
    }

    /// Apply a worker response for this segment's stream
    pub fn handle_response(&mut self, response: WorkerResponse) -> Option<SegmentEvent> {
        match self.encoder.handle_response(response)? {
            EncoderOutput::Wrote {
                compressed_bytes,
                additional_raw_bytes,
                ..
            } => Some(SegmentEvent::SizeUpdated {
                compressed_bytes,
                additional_raw_bytes,
            }),

            EncoderOutput::Finished(result) => Some(SegmentEvent::Flushed(self.flushed_segment(result))),

            EncoderOutput::Aborted(reason) => {
                warn!(
                    "Segment stream {} aborted ({:?}); flushing partial data",
                    self.encoder.stream_id(),
                    reason
                );
                if !self.flushed {
                    self.flushed = true;
                    self.flush_reason = Some(CreationReason::StreamAborted);
                    self.unwritten_suffix = Some(self.suffix());
                }
                Some(SegmentEvent::Aborted(self.complete_sync()))
            }
        }
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn metadata(&self) -> &SegmentMetadata {
        &self.metadata
    }

    pub fn view_id(&self) -> &str {
        &self.metadata.view.id
    }

    pub fn stream_id(&self) -> StreamId {
        self.encoder.stream_id()
    }

    pub fn records_count(&self) -> u32 {
        self.metadata.records_count
    }

    pub fn compressed_bytes_count(&self) -> usize {
        self.encoder.compressed_bytes_count()
    }

    pub fn raw_bytes_count(&self) -> usize {
        self.encoder.raw_bytes_count()
    }

    fn suffix(&self) -> String {
        match serde_json::to_string(&self.metadata) {
            Ok(json) => {
                let fields = json.strip_prefix('{').unwrap_or(&json);
                format!("],{}\n", fields)
            }
            Err(e) => {
                warn!("Segment metadata serialization error: {}", e);
                "]}\n".to_string()
            }
        }
    }

    fn complete_sync(&mut self) -> FlushedSegment {
        let mut result = self.encoder.finish_sync();
        if let Some(suffix) = self.unwritten_suffix.take() {
            result.pending_data.push_str(&suffix);
        }
        self.flushed_segment(result)
    }

    fn flushed_segment(&self, result: EncoderResult) -> FlushedSegment {
        FlushedSegment {
            metadata: self.metadata.clone(),
            result,
            reason: self.flush_reason.unwrap_or(CreationReason::SdkStopped),
        }
    }
}
