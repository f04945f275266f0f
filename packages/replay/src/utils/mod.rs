// packages/replay/src/utils/mod.rs
//! Common utilities: error types and configuration

pub mod config;
pub mod errors;

pub use config::{ObservabilityConfig, ReplayConfig, SegmentConfig, WorkerConfig};
pub use errors::{ReplayError, Result, WorkerUnavailable};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
