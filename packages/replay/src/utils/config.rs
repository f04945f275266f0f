// packages/replay/src/utils/config.rs
//! Recorder configuration
//!
//! Values come from defaults, an optional `replay.{toml,yaml,json}` file and
//! `REPLAY__`-prefixed environment variables, in that order of precedence
//! (e.g. `REPLAY__SEGMENT__MAX_SIZE_BYTES=120000`).

use crate::utils::errors::{ReplayError, Result};
use crate::worker::compressor::CompressionLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level recorder configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub segment: SegmentConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

/// Segment flush limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Compressed size above which a segment is flushed (bytes)
    pub max_size_bytes: usize,

    /// Maximum lifetime of a segment (milliseconds)
    pub max_duration_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 60_000,
            max_duration_ms: 30_000,
        }
    }
}

impl SegmentConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Compression worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Time allowed for the `init` handshake (milliseconds)
    pub handshake_timeout_ms: u64,

    /// zstd level used by every stream
    pub compression_level: CompressionLevel,

    /// Name of the worker thread
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            compression_level: CompressionLevel::Fast,
            thread_name: "replay-compressor".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Logging and diagnostics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log directive when `RUST_LOG` is unset
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,

    /// Diagnostic reports allowed per kind per minute
    pub diagnostics_per_minute: u32,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            diagnostics_per_minute: 3,
        }
    }
}

impl ReplayConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("replay").required(false))
            .add_source(
                config::Environment::with_prefix("REPLAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: ReplayConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would stall or spin the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.segment.max_size_bytes == 0 {
            return Err(ReplayError::ConfigError(
                "segment.max_size_bytes must be greater than 0".to_string(),
            ));
        }
        if self.segment.max_duration_ms == 0 {
            return Err(ReplayError::ConfigError(
                "segment.max_duration_ms must be greater than 0".to_string(),
            ));
        }
        if self.worker.handshake_timeout_ms == 0 {
            return Err(ReplayError::ConfigError(
                "worker.handshake_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.worker.thread_name.is_empty() {
            return Err(ReplayError::ConfigError(
                "worker.thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
