// packages/replay/src/utils/errors.rs
//! Error types for the replay recorder

use std::time::Duration;
use thiserror::Error;

/// Crate result type
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors surfaced by the replay recorder
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    
    #[error("Recording failed: {0}")]
    RecordingFailed(String),
    
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
    
    #[error(transparent)]
    WorkerUnavailable(#[from] WorkerUnavailable),
    
    #[error("Recorder is no longer running")]
    RecorderClosed,
    
    #[error("Observability setup failed: {0}")]
    ObservabilityFailed(String),
}

impl From<config::ConfigError> for ReplayError {
    fn from(err: config::ConfigError) -> Self {
        ReplayError::ConfigError(err.to_string())
    }
}

/// Why the compression worker cannot be used
///
/// Once a channel reports one of these it stays unavailable until the
/// process restarts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerUnavailable {
    /// Creation was refused by the environment (permissions, sandbox policy)
    #[error("worker creation blocked by policy: {0}")]
    CreationBlocked(String),
    
    /// Creation failed for any other reason
    #[error("worker creation failed: {0}")]
    CreationFailed(String),
    
    /// The worker never answered the `init` handshake
    #[error("worker handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    
    /// The worker reported an error or went away
    #[error("worker failed: {0}")]
    WorkerFailed(String),
}

impl WorkerUnavailable {
    /// Short stable label used for metrics and diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerUnavailable::CreationBlocked(_) => "creation_blocked",
            WorkerUnavailable::CreationFailed(_) => "creation_failed",
            WorkerUnavailable::HandshakeTimeout(_) => "handshake_timeout",
            WorkerUnavailable::WorkerFailed(_) => "worker_failed",
        }
    }
    
    /// Whether the failure happened before a worker ever existed
    pub fn is_creation_failure(&self) -> bool {
        matches!(
            self,
            WorkerUnavailable::CreationBlocked(_) | WorkerUnavailable::CreationFailed(_)
        )
    }
}
