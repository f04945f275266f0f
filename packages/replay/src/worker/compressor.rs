// packages/replay/src/worker/compressor.rs
//! zstd streaming compression worker
//!
//! Each logical stream owns a zstd frame. Every write is compressed and
//! flushed immediately so the chunk handed back is complete; appending
//! [`FRAME_TRAILER`] to any prefix of the chunks yields a decodable frame.

use crate::utils::config::WorkerConfig;
use crate::utils::errors::{ReplayError, Result, WorkerUnavailable};
use crate::worker::channel::WorkerFactory;
use crate::worker::protocol::{StreamId, WorkerEndpoint, WorkerEvent, WorkerRequest, WorkerResponse};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, trace};

/// Version reported in the handshake
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Empty raw block flagged as last; closes a frame after a flush
pub const FRAME_TRAILER: [u8; 3] = [0x01, 0x00, 0x00];

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// One zstd frame being built incrementally
pub struct StreamCompressor {
    encoder: zstd::stream::write::Encoder<'static, Vec<u8>>,
}

impl StreamCompressor {
    pub fn new(level: CompressionLevel) -> Result<Self> {
        let encoder = zstd::stream::write::Encoder::new(Vec::new(), level.as_i32()).map_err(|e| {
            ReplayError::CompressionFailed(format!("Encoder creation error: {}", e))
        })?;

        Ok(Self { encoder })
    }

    /// Compress `data` and return every byte produced so far
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.encoder
            .write_all(data)
            .and_then(|_| self.encoder.flush())
            .map_err(|e| ReplayError::CompressionFailed(format!("Compression error: {}", e)))?;

        let chunk = std::mem::take(self.encoder.get_mut());
        trace!("Compressed {} bytes -> {} bytes", data.len(), chunk.len());

        Ok(chunk)
    }
}

/// Worker-side request handler, independent of the thread that runs it
pub struct CompressionWorker {
    level: CompressionLevel,
    streams: HashMap<StreamId, StreamCompressor>,
}

impl CompressionWorker {
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            level,
            streams: HashMap::new(),
        }
    }

    /// Handle one request; `Reset` produces no response
    pub fn handle(&mut self, request: WorkerRequest) -> Option<WorkerResponse> {
        match request {
            WorkerRequest::Init => Some(WorkerResponse::Initialized {
                version: WORKER_VERSION.to_string(),
            }),

            WorkerRequest::Write { stream_id, id, data } => {
                let stream = match self.streams.entry(stream_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => match StreamCompressor::new(self.level) {
                        Ok(compressor) => entry.insert(compressor),
                        Err(e) => {
                            return Some(WorkerResponse::Errored {
                                stream_id: Some(stream_id),
                                message: e.to_string(),
                            })
                        }
                    },
                };

                match stream.push(data.as_bytes()) {
                    Ok(chunk) => Some(WorkerResponse::Wrote {
                        stream_id,
                        id,
                        compressed: Bytes::from(chunk),
                        trailer: Bytes::from_static(&FRAME_TRAILER),
                        additional_bytes: data.len(),
                    }),
                    Err(e) => {
                        self.streams.remove(&stream_id);
                        Some(WorkerResponse::Errored {
                            stream_id: Some(stream_id),
                            message: e.to_string(),
                        })
                    }
                }
            }

            WorkerRequest::Finish { stream_id, id } => {
                self.streams.remove(&stream_id);
                Some(WorkerResponse::Finished { stream_id, id })
            }

            WorkerRequest::Reset { stream_id } => {
                self.streams.remove(&stream_id);
                None
            }
        }
    }

    /// Number of streams with live compressor state
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Spawn the compression worker on a dedicated thread
pub fn spawn_worker(config: &WorkerConfig) -> std::result::Result<WorkerEndpoint, WorkerUnavailable> {
    let (request_tx, request_rx) = crossbeam_channel::unbounded::<WorkerRequest>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let level = config.compression_level;

    std::thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || run_worker(request_rx, event_tx, level))
        .map_err(classify_spawn_error)?;

    debug!("Spawned compression worker thread '{}'", config.thread_name);

    Ok(WorkerEndpoint {
        requests: request_tx,
        events: event_rx,
    })
}

fn run_worker(
    inbox: crossbeam_channel::Receiver<WorkerRequest>,
    outbox: UnboundedSender<WorkerEvent>,
    level: CompressionLevel,
) {
    let mut worker = CompressionWorker::new(level);

    for request in inbox.iter() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.handle(request)));

        match outcome {
            Ok(Some(response)) => {
                if outbox.send(WorkerEvent::Message(response)).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(_) => {
                error!("Compression worker panicked");
                let _ = outbox.send(WorkerEvent::Crashed("compression worker panicked".to_string()));
                return;
            }
        }
    }

    debug!("Compression worker exiting");
}

/// Map a thread creation failure onto the two creation buckets
pub fn classify_spawn_error(err: std::io::Error) -> WorkerUnavailable {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => WorkerUnavailable::CreationBlocked(err.to_string()),
        _ => WorkerUnavailable::CreationFailed(err.to_string()),
    }
}

/// Default factory: one OS thread per worker
#[derive(Debug, Clone, Default)]
pub struct ThreadWorkerFactory {
    config: WorkerConfig,
}

impl ThreadWorkerFactory {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn create(&self) -> std::result::Result<WorkerEndpoint, WorkerUnavailable> {
        spawn_worker(&self.config)
    }
}
