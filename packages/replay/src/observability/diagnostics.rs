// packages/replay/src/observability/diagnostics.rs
//! Rate-limited diagnostics channel
//!
//! Failures that must never reach the host (worker loss, protocol
//! violations, unserializable records) are reported here instead. Each kind
//! gets a fixed number of reports per rolling window; the rest only bump a
//! counter.

use crate::observability::names;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Category of a diagnostic report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    WorkerUnavailable,
    StreamProtocolViolation,
    SerializationFailed,
    CaptureFailed,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::WorkerUnavailable => "worker_unavailable",
            DiagnosticKind::StreamProtocolViolation => "stream_protocol_violation",
            DiagnosticKind::SerializationFailed => "serialization_failed",
            DiagnosticKind::CaptureFailed => "capture_failed",
        }
    }
}

/// A single diagnostic report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Destination for diagnostic reports
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, event: &DiagnosticEvent);
}

/// Sink that logs reports at `warn`
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, event: &DiagnosticEvent) {
        warn!(
            target: "replay::diagnostics",
            kind = event.kind.as_str(),
            "{}",
            event.message
        );
    }
}

struct Window {
    started_at: Instant,
    reported: u32,
}

struct RateLimiter {
    limit: u32,
    period: Duration,
    windows: HashMap<DiagnosticKind, Window>,
}

impl RateLimiter {
    fn allow(&mut self, kind: DiagnosticKind, now: Instant) -> bool {
        let window = self.windows.entry(kind).or_insert(Window {
            started_at: now,
            reported: 0,
        });

        if now.duration_since(window.started_at) >= self.period {
            window.started_at = now;
            window.reported = 0;
        }

        if window.reported < self.limit {
            window.reported += 1;
            true
        } else {
            false
        }
    }
}

/// Cloneable diagnostics reporter
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl Diagnostics {
    /// Create a reporter allowing `per_minute` reports per kind
    pub fn new(sink: Arc<dyn DiagnosticSink>, per_minute: u32) -> Self {
        Self::with_period(sink, per_minute, Duration::from_secs(60))
    }

    pub fn with_period(sink: Arc<dyn DiagnosticSink>, limit: u32, period: Duration) -> Self {
        Self {
            sink,
            limiter: Arc::new(Mutex::new(RateLimiter {
                limit,
                period,
                windows: HashMap::new(),
            })),
        }
    }

    /// Report a failure; returns whether it reached the sink
    pub fn report(&self, kind: DiagnosticKind, message: impl Into<String>) -> bool {
        let allowed = self.limiter.lock().allow(kind, Instant::now());

        if !allowed {
            metrics::counter!(names::DIAGNOSTICS_SUPPRESSED, "kind" => kind.as_str()).increment(1);
            return false;
        }

        metrics::counter!(names::DIAGNOSTICS_REPORTED, "kind" => kind.as_str()).increment(1);
        self.sink.report(&DiagnosticEvent {
            kind,
            message: message.into(),
        });
        true
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink), 3)
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingSink;

    #[test]
    fn test_reports_reach_sink() {
        let sink = Arc::new(CollectingSink::default());
        let diagnostics = Diagnostics::new(sink.clone(), 3);

        assert!(diagnostics.report(DiagnosticKind::WorkerUnavailable, "no worker"));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DiagnosticKind::WorkerUnavailable);
        assert_eq!(events[0].message, "no worker");
    }

    #[test]
    fn test_rate_limit_is_per_kind() {
        let sink = Arc::new(CollectingSink::default());
        let diagnostics = Diagnostics::new(sink.clone(), 2);

        assert!(diagnostics.report(DiagnosticKind::StreamProtocolViolation, "1"));
        assert!(diagnostics.report(DiagnosticKind::StreamProtocolViolation, "2"));
        assert!(!diagnostics.report(DiagnosticKind::StreamProtocolViolation, "3"));
        assert!(diagnostics.report(DiagnosticKind::SerializationFailed, "other kind"));

        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_window_resets() {
        let sink = Arc::new(CollectingSink::default());
        let diagnostics = Diagnostics::with_period(sink.clone(), 1, Duration::ZERO);

        assert!(diagnostics.report(DiagnosticKind::CaptureFailed, "a"));
        assert!(diagnostics.report(DiagnosticKind::CaptureFailed, "b"));
        assert_eq!(sink.events().len(), 2);
    }
}
