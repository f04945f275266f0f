// packages/replay/src/recording/mod.rs
//! Record accumulation, segmenting and compression streams
//!
//! - **Record**: one captured unit of page activity
//! - **Stream encoder**: ordered write/finish protocol over the shared worker
//! - **Segment**: a bounded batch of records compressed as one document
//! - **Segment collection**: decides when segments start and flush
//! - **Stats**: per-view counters
//!
//! # Architecture
//!
//! ```text
//! capture → add_record() → SegmentCollection → Segment → StreamEncoder
//!                               ↑                            │ write / finish
//!                               │                            ↓
//!                         worker responses  ◄──────  compression worker
//!                               │
//!                               ↓ flushed
//!                        SegmentTransport::send / send_on_exit
//! ```

pub mod collection;
pub mod encoder;
pub mod payload;
pub mod record;
pub mod segment;
pub mod stats;

// Re-export commonly used types
pub use collection::{
    CollectionDeps, CollectionStatus, ContextProvider, SegmentCollection, SegmentLimits,
    SegmentTimer, TimerToken,
};
pub use encoder::{AbortReason, EncoderOutput, EncoderResult, EncoderState, StreamEncoder};
pub use payload::{PayloadMetadata, SegmentPayload, SegmentTransport};
pub use record::{Record, RecordType};
pub use segment::{
    CreationReason, FlushProgress, FlushReason, FlushedSegment, Segment, SegmentContext,
    SegmentEvent, SegmentMetadata,
};
pub use stats::{ReplayStats, ViewReplayStats, MAX_TRACKED_VIEWS};
