// packages/replay/src/worker/protocol.rs
//! Messages exchanged with the compression worker
//!
//! Everything crossing the worker boundary is an owned value; the two sides
//! share no memory. Requests for one stream are answered in submission
//! order, correlated by the stream-local write id.

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

/// Identifies one logical compression stream on the shared worker
pub type StreamId = u32;

/// Stream-local, strictly increasing request id
pub type WriteId = u64;

/// Request sent to the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Handshake; answered with `Initialized`
    Init,

    /// Compress `data` and return the resulting chunk
    Write {
        stream_id: StreamId,
        id: WriteId,
        data: String,
    },

    /// Close the stream; answered with `Finished` once earlier writes are done
    Finish { stream_id: StreamId, id: WriteId },

    /// Drop the stream's state without answering
    Reset { stream_id: StreamId },
}

impl WorkerRequest {
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            WorkerRequest::Write { stream_id, .. }
            | WorkerRequest::Finish { stream_id, .. }
            | WorkerRequest::Reset { stream_id } => Some(*stream_id),
            WorkerRequest::Init => None,
        }
    }
}

/// Response produced by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    Initialized {
        version: String,
    },

    Wrote {
        stream_id: StreamId,
        id: WriteId,
        /// Compressed bytes produced by this write
        compressed: Bytes,
        /// Bytes that terminate the stream if nothing else is written
        trailer: Bytes,
        /// Encoded (UTF-8) length of the written data
        additional_bytes: usize,
    },

    Finished {
        stream_id: StreamId,
        id: WriteId,
    },

    /// Worker-side failure; `stream_id` is `None` when every stream is affected
    Errored {
        stream_id: Option<StreamId>,
        message: String,
    },
}

impl WorkerResponse {
    /// Stream the response belongs to, if it targets a single stream
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            WorkerResponse::Wrote { stream_id, .. } | WorkerResponse::Finished { stream_id, .. } => {
                Some(*stream_id)
            }
            WorkerResponse::Errored { stream_id, .. } => *stream_id,
            WorkerResponse::Initialized { .. } => None,
        }
    }
}

/// Inbound event from the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Message(WorkerResponse),

    /// The worker died outside of the message protocol
    Crashed(String),
}

/// Both ends of a freshly created worker
pub struct WorkerEndpoint {
    /// Outbound requests (the worker's inbox)
    pub requests: crossbeam_channel::Sender<WorkerRequest>,

    /// Inbound messages and error events
    pub events: UnboundedReceiver<WorkerEvent>,
}

impl std::fmt::Debug for WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEndpoint").finish_non_exhaustive()
    }
}
