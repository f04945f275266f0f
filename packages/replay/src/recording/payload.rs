// packages/replay/src/recording/payload.rs
//! Flushed segments as handed to the transport

use crate::recording::segment::{FlushReason, FlushedSegment, SegmentMetadata};
use crate::utils::errors::{ReplayError, Result};
use bytes::Bytes;
use serde::Serialize;

/// Metadata sent next to the compressed document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadMetadata {
    pub raw_segment_size: usize,
    pub compressed_segment_size: usize,
    #[serde(flatten)]
    pub segment: SegmentMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPayload {
    /// zstd frame covering the acknowledged part of the document
    pub data: Bytes,

    /// Uncompressed tail of the document; empty unless flushed on page exit
    /// or after the stream was lost
    pub pending_data: String,

    pub metadata: PayloadMetadata,
    pub flush_reason: FlushReason,
}

impl SegmentPayload {
    pub fn is_complete(&self) -> bool {
        self.pending_data.is_empty()
    }

    pub fn metadata_json(&self) -> Result<String> {
        serde_json::to_string(&self.metadata).map_err(|e| {
            ReplayError::SerializationFailed(format!("Payload metadata serialization error: {}", e))
        })
    }
}

impl From<FlushedSegment> for SegmentPayload {
    fn from(flushed: FlushedSegment) -> Self {
        let metadata = PayloadMetadata {
            raw_segment_size: flushed.result.raw_bytes_count + flushed.result.pending_data.len(),
            compressed_segment_size: flushed.result.compressed_bytes_count(),
            segment: flushed.metadata,
        };

        Self {
            data: flushed.result.output,
            pending_data: flushed.result.pending_data,
            metadata,
            flush_reason: flushed.reason,
        }
    }
}

/// Delivers flushed segments
pub trait SegmentTransport: Send + Sync {
    fn send(&self, payload: SegmentPayload);

    /// Delivery while the page is going away
    fn send_on_exit(&self, payload: SegmentPayload) {
        self.send(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::encoder::EncoderResult;
    use crate::recording::segment::{CreationReason, IdRef};

    #[test]
    fn test_metadata_is_flattened() {
        let payload = SegmentPayload::from(FlushedSegment {
            metadata: SegmentMetadata {
                application: IdRef { id: "app".into() },
                session: IdRef { id: "s".into() },
                view: IdRef { id: "v".into() },
                start: 1,
                end: 2,
                records_count: 2,
                creation_reason: CreationReason::Init,
                has_full_snapshot: true,
                index_in_view: 0,
                source: "browser",
            },
            result: EncoderResult {
                output: Bytes::from_static(b"abcd"),
                raw_bytes_count: 10,
                pending_data: "xyz".into(),
            },
            reason: CreationReason::PageExit,
        });

        assert!(!payload.is_complete());
        assert_eq!(payload.metadata.raw_segment_size, 13);
        assert_eq!(payload.metadata.compressed_segment_size, 4);

        let json: serde_json::Value =
            serde_json::from_str(&payload.metadata_json().unwrap()).unwrap();
        assert_eq!(json["raw_segment_size"], 13);
        assert_eq!(json["records_count"], 2);
        assert_eq!(json["view"]["id"], "v");
        assert_eq!(json["creation_reason"], "init");
    }
}
