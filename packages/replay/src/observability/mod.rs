// packages/replay/src/observability/mod.rs
//! Logging, metrics and diagnostics
//!
//! - **Tracing**: `tracing-subscriber` with env filter, text or JSON output
//! - **Metrics**: `metrics` facade exported through Prometheus
//! - **Diagnostics**: rate-limited reports for worker and stream failures

pub mod diagnostics;

pub use diagnostics::{DiagnosticEvent, DiagnosticKind, DiagnosticSink, Diagnostics, TracingSink};

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{ReplayError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Metric names
pub mod names {
    pub const RECORDS_ACCEPTED: &str = "replay_records_accepted_total";
    pub const RECORDS_DROPPED: &str = "replay_records_dropped_total";
    pub const SEGMENTS_FLUSHED: &str = "replay_segments_flushed_total";
    pub const SEGMENT_COMPRESSED_BYTES: &str = "replay_segment_compressed_bytes";
    pub const SEGMENT_RAW_BYTES: &str = "replay_segment_raw_bytes";
    pub const DIAGNOSTICS_REPORTED: &str = "replay_diagnostics_reported_total";
    pub const DIAGNOSTICS_SUPPRESSED: &str = "replay_diagnostics_suppressed_total";
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `config.log_level` when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ReplayError::ObservabilityFailed(format!("Invalid log filter: {}", e)))?;
    
    let registry = tracing_subscriber::registry().with(filter);
    
    let result = if config.json_logs {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    
    result.map_err(|e| ReplayError::ObservabilityFailed(format!("Tracing init failed: {}", e)))
}

/// Install the Prometheus metrics recorder
///
/// No HTTP listener is started; callers render the returned handle wherever
/// they expose metrics.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ReplayError::ObservabilityFailed(format!("Metrics init failed: {}", e)))
}
