// packages/replay/src/main.rs
//! Sentra Lab Session Replay demo
//!
//! Records a synthetic page: incremental records arrive every few hundred
//! milliseconds, the view changes periodically, and Ctrl+C simulates the
//! page unloading.

use anyhow::Result;
use sentra_lab_replay::observability::{init_metrics, init_tracing, Diagnostics, TracingSink};
use sentra_lab_replay::recorder::{
    AlwaysSupported, CaptureFactory, CaptureSession, PageEvent, RecordSink, Recorder,
    RecorderDeps, SessionProvider,
};
use sentra_lab_replay::recording::{
    ContextProvider, Record, RecordType, SegmentContext, SegmentLimits, SegmentPayload,
    SegmentTransport,
};
use sentra_lab_replay::utils::config::ReplayConfig;
use sentra_lab_replay::worker::{ThreadWorkerFactory, WorkerChannel};
use sentra_lab_replay::BuildInfo;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use ulid::Ulid;

/// One application, one session, a new view on every navigation
struct DemoContext {
    application_id: String,
    session_id: String,
    view_id: Mutex<String>,
}

impl DemoContext {
    fn new() -> Self {
        Self {
            application_id: Ulid::new().to_string(),
            session_id: Ulid::new().to_string(),
            view_id: Mutex::new(Ulid::new().to_string()),
        }
    }

    fn navigate(&self) -> String {
        let view_id = Ulid::new().to_string();
        *self.view_id.lock() = view_id.clone();
        view_id
    }
}

impl ContextProvider for DemoContext {
    fn compute_context(&self) -> Option<SegmentContext> {
        Some(SegmentContext {
            application_id: self.application_id.clone(),
            session_id: self.session_id.clone(),
            view_id: self.view_id.lock().clone(),
        })
    }
}

struct SampledSession;

impl SessionProvider for SampledSession {
    fn is_replay_allowed(&self) -> bool {
        true
    }
}

/// Emits a scroll-like incremental record on a fixed cadence
struct SyntheticCapture {
    interval: Duration,
}

impl CaptureFactory for SyntheticCapture {
    fn start(&self, sink: RecordSink) -> sentra_lab_replay::Result<Box<dyn CaptureSession>> {
        let stopped = Arc::new(AtomicBool::new(false));
        let interval = self.interval;

        tokio::spawn({
            let stopped = stopped.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                let mut position = 0u64;
                while !stopped.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    position += 40;
                    let record = Record::new(
                        RecordType::IncrementalSnapshot,
                        sentra_lab_replay::utils::now_ms(),
                        serde_json::json!({"source": 3, "x": 0, "y": position}),
                    );
                    if !sink.add_record(record) {
                        break;
                    }
                }
            }
        });

        Ok(Box::new(SyntheticSession { stopped }))
    }
}

struct SyntheticSession {
    stopped: Arc<AtomicBool>,
}

impl CaptureSession for SyntheticSession {
    fn flush_mutations(&mut self) -> Vec<Record> {
        Vec::new()
    }

    fn take_full_snapshot(&mut self, timestamp: i64) -> Vec<Record> {
        vec![
            Record::new(
                RecordType::Meta,
                timestamp,
                serde_json::json!({"href": "https://example.com/", "width": 1280, "height": 720}),
            ),
            Record::new(
                RecordType::FullSnapshot,
                timestamp,
                serde_json::json!({"node": {"type": 0, "childNodes": []}}),
            ),
        ]
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Logs payloads instead of sending them
struct LoggingTransport;

impl LoggingTransport {
    fn log(&self, payload: &SegmentPayload, on_exit: bool) {
        match payload.metadata_json() {
            Ok(metadata) => info!(
                on_exit,
                bytes = payload.data.len(),
                pending = payload.pending_data.len(),
                "Segment ready: {}",
                metadata
            ),
            Err(e) => warn!("Unprintable segment: {}", e),
        }
    }
}

impl SegmentTransport for LoggingTransport {
    fn send(&self, payload: SegmentPayload) {
        self.log(&payload, false);
    }

    fn send_on_exit(&self, payload: SegmentPayload) {
        self.log(&payload, true);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = ReplayConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    let prometheus = init_metrics()?;

    let build = BuildInfo::current();
    info!(
        "Starting Sentra Lab Session Replay v{} ({}, built {})",
        build.version, build.git_hash, build.build_timestamp
    );
    info!("Configuration loaded: {:?}", config);

    let diagnostics = Diagnostics::new(
        Arc::new(TracingSink),
        config.observability.diagnostics_per_minute,
    );
    let worker = WorkerChannel::new(
        Arc::new(ThreadWorkerFactory::new(config.worker.clone())),
        config.worker.handshake_timeout(),
        diagnostics.clone(),
    );
    let context = Arc::new(DemoContext::new());

    let recorder = Recorder::new(
        RecorderDeps {
            capture: Arc::new(SyntheticCapture {
                interval: Duration::from_millis(250),
            }),
            session: Arc::new(SampledSession),
            environment: Arc::new(AlwaysSupported),
            page: Arc::new(AlwaysSupported),
            context: context.clone(),
            transport: Arc::new(LoggingTransport),
            worker,
            diagnostics,
        },
        SegmentLimits::from(&config.segment),
    )
    .spawn();

    recorder.start()?;

    let mut navigation = tokio::time::interval(Duration::from_secs(10));
    navigation.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Received shutdown signal, flushing...");
                break;
            }

            _ = navigation.tick() => {
                let view_id = context.navigate();
                info!("Navigated to view {}", view_id);
                recorder.page_event(PageEvent::ViewChange)?;
            }
        }
    }

    recorder.page_event(PageEvent::BeforeUnload)?;
    let last_view = context.view_id.lock().clone();
    if let Some(stats) = recorder.replay_stats(&last_view).await? {
        info!("Replay stats for the last view: {:?}", stats);
    }
    recorder.shutdown().await?;

    info!("Metrics:\n{}", prometheus.render());
    Ok(())
}
