// packages/replay/src/recorder/state_machine.rs
//! Recorder lifecycle as a pure transition table
//!
//! ```text
//! Stopped ─start─► IntendToStart ─attempt(eligible)─► ListeningForInteractive
//!                        ▲                                    │ interactive
//!                        │ reset (from any later state)       ▼
//! Started ◄─started─ Starting ◄─────acquired───── ListeningForWorker
//!
//! stop (any state but Stopped) ─► Stopped
//! worker unavailable           ─► Stopped
//! ```
//!
//! Side effects are returned as data and executed by the driver.

/// Observable recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecorderStatus {
    Stopped,
    IntendToStart,
    ListeningForInteractive,
    ListeningForWorker,
    Starting,
    Started,
}

impl RecorderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderStatus::Stopped => "stopped",
            RecorderStatus::IntendToStart => "intend_to_start",
            RecorderStatus::ListeningForInteractive => "listening_for_interactive",
            RecorderStatus::ListeningForWorker => "listening_for_worker",
            RecorderStatus::Starting => "starting",
            RecorderStatus::Started => "started",
        }
    }

    /// A capture session may be running
    fn has_recording(&self) -> bool {
        matches!(self, RecorderStatus::Starting | RecorderStatus::Started)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderEvent {
    Start,
    /// Guard already evaluated: session allows replay and the environment
    /// supports recording
    AttemptStart { eligible: bool },
    DocumentInteractive,
    WorkerAcquired,
    WorkerUnavailable,
    RecordingStarted,
    Stop,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    SubscribeInteractive,
    UnsubscribeInteractive,
    ClearWorker,
    AcquireWorker,
    StartRecording,
    StopRecording,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: RecorderStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: RecorderStatus, effects: Vec<Effect>) -> Option<Self> {
        Some(Self { next, effects })
    }
}

/// Next status and effects for `event`, or `None` if the event is ignored
pub fn transition(status: RecorderStatus, event: RecorderEvent) -> Option<Transition> {
    use Effect::*;
    use RecorderEvent as E;
    use RecorderStatus as S;

    match (status, event) {
        (S::Stopped, E::Start) => Transition::to(S::IntendToStart, vec![]),

        (S::IntendToStart, E::AttemptStart { eligible: true }) => {
            Transition::to(S::ListeningForInteractive, vec![SubscribeInteractive])
        }

        (S::ListeningForInteractive, E::DocumentInteractive) => {
            Transition::to(S::ListeningForWorker, vec![ClearWorker, AcquireWorker])
        }

        (S::ListeningForWorker, E::WorkerAcquired) => {
            Transition::to(S::Starting, vec![StartRecording])
        }

        (S::Starting, E::RecordingStarted) => Transition::to(S::Started, vec![]),

        (S::ListeningForWorker | S::Starting | S::Started, E::WorkerUnavailable)
        | (S::IntendToStart
            | S::ListeningForInteractive
            | S::ListeningForWorker
            | S::Starting
            | S::Started, E::Stop) => {
            let mut effects = Vec::new();
            if status.has_recording() {
                effects.push(StopRecording);
            }
            effects.push(UnsubscribeInteractive);
            Transition::to(S::Stopped, effects)
        }

        (S::ListeningForInteractive | S::ListeningForWorker | S::Starting | S::Started, E::Reset) => {
            let effects = if status.has_recording() {
                vec![StopRecording]
            } else {
                vec![]
            };
            Transition::to(S::IntendToStart, effects)
        }

        _ => None,
    }
}
