// packages/replay/src/lib.rs
//! Sentra Lab Session Replay Library
//!
//! Turns an unbounded stream of captured page records into ordered,
//! size-bounded, compressed segments. Compression runs on a dedicated worker
//! thread reached only through message passing.
//!
//! # Architecture
//!
//! The library is structured into several key modules:
//!
//! - **worker**: compression worker thread and the shared worker channel
//! - **recording**: records, stream encoders, segments and the flush engine
//! - **recorder**: lifecycle state machine and its async driver
//! - **observability**: tracing, metrics and rate-limited diagnostics
//! - **utils**: errors and configuration

// Public module exports
pub mod observability;
pub mod recorder;
pub mod recording;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use recorder::{PageEvent, Recorder, RecorderDeps, RecorderHandle, RecorderStatus};
pub use recording::{CreationReason, Record, RecordType, SegmentPayload, SegmentTransport};
pub use utils::config::ReplayConfig;
pub use utils::errors::{ReplayError, Result};
pub use worker::{ThreadWorkerFactory, WorkerChannel};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Library build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
        }
    }
}
