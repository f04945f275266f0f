// packages/replay/src/recording/encoder.rs
//! Per-segment compression stream over the shared worker
//!
//! Writes are fire-and-forget: the encoder remembers each one in a FIFO and
//! matches acknowledgements against its head. The worker answers a stream
//! strictly in submission order, so any mismatch means the stream can no
//! longer be trusted and it is abandoned.
//!
//! Counters only move when the worker acknowledges a write; the raw size is
//! the encoded byte length reported by the worker.

use crate::observability::{DiagnosticKind, Diagnostics};
use crate::worker::channel::WorkerLink;
use crate::worker::protocol::{StreamId, WorkerRequest, WorkerResponse, WriteId};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

/// Final output of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderResult {
    /// Compressed chunks followed by the trailer (empty if nothing was acknowledged)
    pub output: Bytes,

    /// Encoded bytes covered by `output`
    pub raw_bytes_count: usize,

    /// Data written but never acknowledged, in write order
    pub pending_data: String,
}

impl EncoderResult {
    pub fn compressed_bytes_count(&self) -> usize {
        self.output.len()
    }
}

/// Why a stream stopped listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// An acknowledgement did not match the oldest pending request
    OutOfOrder {
        expected: Option<WriteId>,
        received: WriteId,
    },

    /// The worker reported an error for this stream or died
    WorkerError(String),
}

/// What an acknowledgement meant for the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutput {
    Wrote {
        id: WriteId,
        /// Total compressed bytes so far, trailer excluded
        compressed_bytes: usize,
        additional_raw_bytes: usize,
    },
    Finished(EncoderResult),
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Open,
    /// `finish` sent; waiting for the worker to catch up
    Finishing,
    Finished,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Write,
    Finish,
}

#[derive(Debug)]
struct PendingWrite {
    id: WriteId,
    kind: PendingKind,
    data: String,
}

/// One logical compression stream
pub struct StreamEncoder {
    link: WorkerLink,
    stream_id: StreamId,
    state: EncoderState,
    pending: VecDeque<PendingWrite>,
    next_write_id: WriteId,
    chunks: Vec<Bytes>,
    trailer: Bytes,
    compressed_bytes_count: usize,
    raw_bytes_count: usize,
    diagnostics: Diagnostics,
}

impl StreamEncoder {
    /// Open a new stream whose responses are routed to `responses`
    pub fn new(
        link: WorkerLink,
        responses: UnboundedSender<WorkerResponse>,
        diagnostics: Diagnostics,
    ) -> Self {
        let stream_id = link.open_stream(responses);

        Self {
            link,
            stream_id,
            state: EncoderState::Open,
            pending: VecDeque::new(),
            next_write_id: 0,
            chunks: Vec::new(),
            trailer: Bytes::new(),
            compressed_bytes_count: 0,
            raw_bytes_count: 0,
            diagnostics,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    /// Nothing has ever been written
    pub fn is_empty(&self) -> bool {
        self.next_write_id == 0
    }

    /// Acknowledged compressed bytes, trailer excluded
    pub fn compressed_bytes_count(&self) -> usize {
        self.compressed_bytes_count
    }

    /// Acknowledged encoded bytes
    pub fn raw_bytes_count(&self) -> usize {
        self.raw_bytes_count
    }

    /// Requests sent but not yet acknowledged
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Queue `data` for compression; a no-op once the stream is closing or dead
    pub fn write(&mut self, data: String) -> Option<WriteId> {
        if self.state != EncoderState::Open {
            trace!("Ignoring write on stream {} in state {:?}", self.stream_id, self.state);
            return None;
        }

        let id = self.next_id();
        if !self.link.post(WorkerRequest::Write {
            stream_id: self.stream_id,
            id,
            data: data.clone(),
        }) {
            // The link answers with `Errored` on our route; the abort keeps this data
            warn!("Compression worker is gone; stream {} will abort", self.stream_id);
        }

        self.pending.push_back(PendingWrite {
            id,
            kind: PendingKind::Write,
            data,
        });
        Some(id)
    }

    /// Ask the worker to close the stream
    ///
    /// Earlier writes are still acknowledged in order; the result arrives as
    /// [`EncoderOutput::Finished`] after them.
    pub fn finish(&mut self) -> bool {
        if self.state != EncoderState::Open {
            return false;
        }

        let id = self.next_id();
        self.link.post(WorkerRequest::Finish {
            stream_id: self.stream_id,
            id,
        });
        self.pending.push_back(PendingWrite {
            id,
            kind: PendingKind::Finish,
            data: String::new(),
        });
        self.state = EncoderState::Finishing;
        true
    }

    /// Close the stream now with whatever has been acknowledged
    ///
    /// Pending acknowledgements are dropped and never surface; their data is
    /// returned as `pending_data`.
    pub fn finish_sync(&mut self) -> EncoderResult {
        let pending_data: String = self
            .pending
            .drain(..)
            .filter(|pending| pending.kind == PendingKind::Write)
            .map(|pending| pending.data)
            .collect();

        if self.state != EncoderState::Finished {
            self.link.close_stream(self.stream_id);
            if !self.is_empty() {
                self.link.post(WorkerRequest::Reset {
                    stream_id: self.stream_id,
                });
            }
            self.state = EncoderState::Finished;
        }

        self.consume(pending_data)
    }

    /// Apply a worker response addressed to this stream
    pub fn handle_response(&mut self, response: WorkerResponse) -> Option<EncoderOutput> {
        if !matches!(self.state, EncoderState::Open | EncoderState::Finishing) {
            return None;
        }

        match response {
            WorkerResponse::Wrote {
                stream_id,
                id,
                compressed,
                trailer,
                additional_bytes,
            } if stream_id == self.stream_id => match self.pending.pop_front() {
                Some(head) if head.id == id && head.kind == PendingKind::Write => {
                    self.compressed_bytes_count += compressed.len();
                    self.raw_bytes_count += additional_bytes;
                    self.trailer = trailer;
                    self.chunks.push(compressed);

                    Some(EncoderOutput::Wrote {
                        id,
                        compressed_bytes: self.compressed_bytes_count,
                        additional_raw_bytes: additional_bytes,
                    })
                }
                head => Some(self.abort_out_of_order(head, id)),
            },

            WorkerResponse::Finished { stream_id, id } if stream_id == self.stream_id => {
                match self.pending.pop_front() {
                    Some(head) if head.id == id && head.kind == PendingKind::Finish => {
                        self.state = EncoderState::Finished;
                        self.link.close_stream(self.stream_id);
                        Some(EncoderOutput::Finished(self.consume(String::new())))
                    }
                    head => Some(self.abort_out_of_order(head, id)),
                }
            }

            WorkerResponse::Errored { stream_id, message }
                if stream_id.map_or(true, |id| id == self.stream_id) =>
            {
                warn!("Stream {} lost its worker: {}", self.stream_id, message);
                self.state = EncoderState::Aborted;
                self.link.close_stream(self.stream_id);
                Some(EncoderOutput::Aborted(AbortReason::WorkerError(message)))
            }

            _ => None,
        }
    }

    fn next_id(&mut self) -> WriteId {
        let id = self.next_write_id;
        self.next_write_id += 1;
        id
    }

    fn abort_out_of_order(&mut self, head: Option<PendingWrite>, received: WriteId) -> EncoderOutput {
        let expected = head.as_ref().map(|pending| pending.id);
        if let Some(head) = head {
            self.pending.push_front(head);
        }

        self.state = EncoderState::Aborted;
        self.link.close_stream(self.stream_id);

        self.diagnostics.report(
            DiagnosticKind::StreamProtocolViolation,
            format!(
                "stream {}: expected response {:?}, received {}",
                self.stream_id, expected, received
            ),
        );

        EncoderOutput::Aborted(AbortReason::OutOfOrder { expected, received })
    }

    fn consume(&mut self, pending_data: String) -> EncoderResult {
        let mut output = BytesMut::with_capacity(self.compressed_bytes_count + self.trailer.len());
        for chunk in self.chunks.drain(..) {
            output.extend_from_slice(&chunk);
        }
        if !output.is_empty() {
            output.extend_from_slice(&self.trailer);
        }

        let result = EncoderResult {
            output: output.freeze(),
            raw_bytes_count: self.raw_bytes_count,
            pending_data,
        };

        self.compressed_bytes_count = 0;
        self.raw_bytes_count = 0;
        self.trailer = Bytes::new();

        result
    }
}

impl Drop for StreamEncoder {
    fn drop(&mut self) {
        self.link.close_stream(self.stream_id);
    }
}
