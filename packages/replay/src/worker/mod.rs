// packages/replay/src/worker/mod.rs
//! Compression worker and the channel that shares it
//!
//! - **Protocol**: request/response messages, correlated per stream by id
//! - **Compressor**: zstd streaming compression running on its own thread
//! - **Channel**: singleton lifecycle (handshake, timeout, failure) and
//!   per-stream response routing
//!
//! # Architecture
//!
//! ```text
//! StreamEncoder ─┐                              ┌─► stream 0 responses
//! StreamEncoder ─┼─► WorkerLink ══ crossbeam ══► worker thread
//! StreamEncoder ─┘       ▲                             │
//!                        └──── dispatcher task ◄═ mpsc ┘
//! ```

pub mod channel;
pub mod compressor;
pub mod protocol;

// Re-export commonly used types
pub use channel::{ChannelStatus, WorkerAvailability, WorkerChannel, WorkerFactory, WorkerLink};
pub use compressor::{CompressionLevel, CompressionWorker, StreamCompressor, ThreadWorkerFactory};
pub use protocol::{StreamId, WorkerEndpoint, WorkerEvent, WorkerRequest, WorkerResponse, WriteId};
