// packages/replay/src/recorder/mod.rs
//! Recorder lifecycle
//!
//! - **State machine**: pure `(status, event) → (status, effects)` table
//! - **Driver**: Tokio task executing effects and owning the recording
//! - **Collaborators**: capture, session, environment and page interfaces
//!
//! # Architecture
//!
//! ```text
//! RecorderHandle ──commands──► RecorderTask ──effects──► capture / worker channel
//!                                  │  ▲
//!                                  ▼  │ responses, timers
//!                          SegmentCollection ──► SegmentTransport
//! ```

pub mod collaborators;
pub mod driver;
pub mod state_machine;

// Re-export commonly used types
pub use collaborators::{
    AlwaysSupported, CaptureFactory, CaptureSession, EnvironmentProbe, PageReadiness, RecordSink,
    RecordingId, SessionProvider,
};
pub use driver::{PageEvent, Recorder, RecorderDeps, RecorderHandle, TokioTimer};
pub use state_machine::{transition, Effect, RecorderEvent, RecorderStatus, Transition};
