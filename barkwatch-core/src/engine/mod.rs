//! `BarkEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! BarkEngine::new(config, tagger, encoder, catalog)
//!     └─► warm_up()          → models loaded, label bank cached, Idle
//!         └─► start()        → capture + detector + evidence workers, Listening
//!             └─► stop()     → cancellation, bounded join, Stopped
//! ```
//!
//! `start()`/`stop()` are idempotent: calling them in the wrong state
//! returns an error rather than panicking.
//!
//! ## Threading
//!
//! Three blocking workers run under `tokio::task::spawn_blocking`:
//!
//! - **capture** — owns the cpal stream (`!Send`, so it is created and
//!   dropped inside the worker), assembles timestamped frames into the
//!   shared ring, emits ~10 Hz level ticks, and reopens the device with
//!   100 ms → 30 s exponential backoff when the stream dies.
//! - **detector** — the tick loop in [`pipeline`].
//! - **evidence** — the clip recorder in [`crate::evidence`].
//!
//! Fan-out uses bounded `tokio::sync::broadcast` channels: a send never
//! blocks the pipeline, and a subscriber that falls a whole channel behind
//! observes `Lagged` and has effectively been dropped from the missed
//! range.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    audio::{device, AudioCapture, CaptureRequest, CaptureSignals},
    buffering::{create_sample_ring, AudioFrame, Consumer, FrameRing, SampleConsumer},
    config::Config,
    detect::{fine::LabelBank, CoarseClassifier, DecisionSmoother, EnergyGate, FineClassifier},
    doa::DoaEstimator,
    error::{BarkError, Result},
    evidence::{self, DeviceMeta, EvidenceIndex, EvidenceMsg},
    fingerprint::{FingerprintMatcher, ProfileCatalog},
    inference::{EncoderHandle, TaggerHandle},
    ipc::events::{
        AudioLevelTick, BarkEvent, EngineStatus, EngineStatusEvent, Fingerprint, LastEventRef,
        PipelineStageTelemetry, StatusSnapshot,
    },
};

/// Broadcast channel capacity per event stream.
const BROADCAST_CAP: usize = 256;
/// Device reopen backoff bounds.
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Capture drain sleep when the SPSC ring is empty.
const DRAIN_IDLE: Duration = Duration::from_millis(2);
/// Level tick cadence (~10 Hz).
const LEVEL_INTERVAL: Duration = Duration::from_millis(100);
/// Centroid rebuild cadence under the `periodic` refresh policy.
const CENTROID_REFRESH_PERIOD: Duration = Duration::from_secs(300);

/// Actual capture parameters, reported once the device is open.
#[derive(Debug, Clone)]
struct CaptureInfo {
    device_name: String,
    sample_rate: u32,
    channels: u16,
}

/// Decrements the live-worker count when a worker exits.
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn register(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The top-level supervisor handle.
///
/// `BarkEngine` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<BarkEngine>` to share between the host application and
/// event-forwarding tasks.
pub struct BarkEngine {
    config: Config,
    tagger: Option<TaggerHandle>,
    encoder: Option<EncoderHandle>,
    catalog: Option<Arc<dyn ProfileCatalog>>,
    /// `true` while workers are active.
    running: Arc<AtomicBool>,
    warmed: AtomicBool,
    coarse_degraded: AtomicBool,
    status: Arc<Mutex<EngineStatus>>,
    event_tx: broadcast::Sender<BarkEvent>,
    telemetry_tx: broadcast::Sender<PipelineStageTelemetry>,
    level_tx: broadcast::Sender<AudioLevelTick>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    fingerprint_tx: broadcast::Sender<Fingerprint>,
    counters: Arc<pipeline::PipelineCounters>,
    label_bank: Mutex<Option<Arc<LabelBank>>>,
    matcher: Mutex<Option<Arc<FingerprintMatcher>>>,
    index: Mutex<Option<Arc<EvidenceIndex>>>,
    ring: Mutex<Option<Arc<FrameRing>>>,
    last_event: Arc<Mutex<Option<LastEventRef>>>,
    last_error: Arc<Mutex<Option<String>>>,
    device_name: Arc<Mutex<Option<String>>>,
    started_at: Mutex<Option<Instant>>,
    /// Frame sequence counter; survives device reopens within a session.
    frame_seq: Arc<AtomicU64>,
    level_seq: Arc<AtomicU64>,
    active_workers: Arc<AtomicUsize>,
}

impl BarkEngine {
    /// Create an engine. Validates the configuration; does not touch the
    /// audio device or the models — call `warm_up()` then `start()`.
    pub fn new(
        config: Config,
        tagger: Option<TaggerHandle>,
        encoder: Option<EncoderHandle>,
        catalog: Option<Arc<dyn ProfileCatalog>>,
    ) -> Result<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (telemetry_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (fingerprint_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            config,
            tagger,
            encoder,
            catalog,
            running: Arc::new(AtomicBool::new(false)),
            warmed: AtomicBool::new(false),
            coarse_degraded: AtomicBool::new(false),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            event_tx,
            telemetry_tx,
            level_tx,
            status_tx,
            fingerprint_tx,
            counters: Arc::new(pipeline::PipelineCounters::default()),
            label_bank: Mutex::new(None),
            matcher: Mutex::new(None),
            index: Mutex::new(None),
            ring: Mutex::new(None),
            last_event: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            device_name: Arc::new(Mutex::new(None)),
            started_at: Mutex::new(None),
            frame_seq: Arc::new(AtomicU64::new(0)),
            level_seq: Arc::new(AtomicU64::new(0)),
            active_workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Load both model backends, cache the label bank and build the
    /// centroid index. Idempotent; called implicitly by `start()` when
    /// skipped.
    ///
    /// # Errors
    /// - Fine backend missing or failing to load is fatal when the fine
    ///   stage is enabled.
    /// - Coarse backend failure is fatal only with
    ///   `coarse.fallback_on_error = block`; with `pass` the stage
    ///   degrades to always-pass (logged once).
    pub fn warm_up(&self) -> Result<()> {
        if self.warmed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.set_status(EngineStatus::WarmingUp, None);

        if self.config.fine.enabled {
            let Some(encoder) = &self.encoder else {
                self.set_status(EngineStatus::Error, Some("no zero-shot backend".into()));
                return Err(BarkError::ModelLoad {
                    stage: "fine",
                    message: "no zero-shot encoder backend installed".into(),
                });
            };
            encoder.0.lock().warm_up().map_err(|e| {
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                BarkError::ModelLoad {
                    stage: "fine",
                    message: e.to_string(),
                }
            })?;

            // Text embeddings are computed exactly once, here. The hot
            // path is audio-only.
            let bank = LabelBank::build(&self.config.fine, encoder).map_err(|e| {
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                e
            })?;
            info!(labels = bank.len(), "label bank cached");
            *self.label_bank.lock() = Some(Arc::new(bank));
        }

        if self.config.coarse.enabled {
            let load_result = match &self.tagger {
                Some(tagger) => tagger.0.lock().warm_up(),
                None => Err(BarkError::ModelLoad {
                    stage: "coarse",
                    message: "no tagger backend installed".into(),
                }),
            };
            if let Err(e) = load_result {
                match self.config.coarse.fallback_on_error {
                    crate::config::FallbackMode::Pass => {
                        warn!(error = %e, "coarse tagger unavailable — stage degraded to always-pass");
                        self.coarse_degraded.store(true, Ordering::SeqCst);
                    }
                    crate::config::FallbackMode::Block => {
                        self.set_status(EngineStatus::Error, Some(e.to_string()));
                        return Err(e);
                    }
                }
            }
        }

        if let Some(catalog) = &self.catalog {
            let matcher = Arc::new(FingerprintMatcher::new(
                &self.config.fingerprint,
                Arc::clone(catalog),
            ));
            *self.matcher.lock() = Some(matcher);
        }

        self.warmed.store(true, Ordering::SeqCst);
        self.set_status(EngineStatus::Idle, None);
        info!("engine warm-up complete");
        Ok(())
    }

    /// Start capture, detection and evidence recording.
    ///
    /// Blocks until the audio device is confirmed open (or fails), then
    /// returns; the workers continue in background blocking threads.
    ///
    /// # Errors
    /// - `BarkError::AlreadyRunning` if already started.
    /// - Device errors from the initial open. Later device loss is retried
    ///   with backoff instead of surfacing here.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(BarkError::AlreadyRunning);
        }
        self.warm_up()?;

        self.counters.reset();
        self.frame_seq.store(0, Ordering::SeqCst);
        self.level_seq.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.set_status(EngineStatus::Listening, None);
        *self.started_at.lock() = Some(Instant::now());

        let ring = Arc::new(FrameRing::with_duration(
            self.config.ring_seconds(),
            self.config.audio.sample_rate,
            self.config.audio.chunk_samples,
        ));
        *self.ring.lock() = Some(Arc::clone(&ring));

        // ── Capture worker ───────────────────────────────────────────────
        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<CaptureInfo>>();
        self.spawn_capture_worker(Arc::clone(&ring), open_tx);

        let info = match open_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("capture worker died".into()));
                return Err(BarkError::Other(anyhow::anyhow!(
                    "capture worker died before opening a device"
                )));
            }
        };

        // ── Evidence worker ──────────────────────────────────────────────
        let evidence_tx = self.spawn_evidence_worker(Arc::clone(&ring), &info);

        // ── Detector worker ──────────────────────────────────────────────
        if let Err(e) = self.spawn_detector_worker(Arc::clone(&ring), evidence_tx) {
            self.running.store(false, Ordering::SeqCst);
            self.set_status(EngineStatus::Error, Some(e.to_string()));
            return Err(e);
        }

        // ── Periodic centroid refresh (policy-dependent) ─────────────────
        if self.config.fingerprint.centroid_refresh_policy
            == crate::config::CentroidRefreshPolicy::Periodic
        {
            if let Some(matcher) = self.matcher.lock().clone() {
                let running = Arc::clone(&self.running);
                let guard = WorkerGuard::register(&self.active_workers);
                tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    while running.load(Ordering::SeqCst) {
                        sleep_cancellable(CENTROID_REFRESH_PERIOD, &running);
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        matcher.refresh_centroids(None);
                    }
                });
            }
        }

        info!(
            device = info.device_name.as_str(),
            sample_rate = info.sample_rate,
            channels = info.channels,
            "engine started — listening"
        );
        Ok(())
    }

    /// Stop all workers: cancellation now, then a bounded join.
    ///
    /// Workers observe cancellation at tick/clip boundaries; this call
    /// waits up to `2 × tick + 1 s` for them to drain before returning.
    ///
    /// # Errors
    /// `BarkError::NotRunning` if not currently running.
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BarkError::NotRunning);
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");

        let deadline = Instant::now() + self.config.stop_grace();
        while self.active_workers.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let stragglers = self.active_workers.load(Ordering::SeqCst);
        if stragglers > 0 {
            warn!(stragglers, "workers still draining after grace period");
        }
        Ok(())
    }

    /// Current engine status.
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// Point-in-time snapshot for the external status surface.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let running = self.running.load(Ordering::SeqCst);
        let uptime_s = if running {
            (*self.started_at.lock())
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        } else {
            0.0
        };
        StatusSnapshot {
            running,
            uptime_s,
            counters: self.counters.snapshot(),
            last_event: self.last_event.lock().clone(),
            device_name: self.device_name.lock().clone(),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Subscribe to bark events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BarkEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to per-tick stage telemetry.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<PipelineStageTelemetry> {
        self.telemetry_tx.subscribe()
    }

    /// Subscribe to ~10 Hz VU level ticks.
    pub fn subscribe_levels(&self) -> broadcast::Receiver<AudioLevelTick> {
        self.level_tx.subscribe()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to fingerprints emitted toward the external catalog.
    pub fn subscribe_fingerprints(&self) -> broadcast::Receiver<Fingerprint> {
        self.fingerprint_tx.subscribe()
    }

    /// Rebuild centroids after the catalog reports a tagged-set change.
    /// No-op (logged) when no catalog was installed.
    pub fn refresh_centroids(&self, dog_id: Option<&str>) {
        match &*self.matcher.lock() {
            Some(matcher) => matcher.refresh_centroids(dog_id),
            None => warn!("refresh_centroids called without a profile catalog"),
        }
    }

    /// Evidence index of the current/most recent session, when evidence
    /// recording initialised successfully.
    pub fn evidence_index(&self) -> Option<Arc<EvidenceIndex>> {
        self.index.lock().clone()
    }

    /// Snapshot of the most recent `seconds` of captured audio, oldest
    /// frame first. Empty before the first `start()`.
    pub fn snapshot(&self, seconds: f64) -> Vec<Arc<AudioFrame>> {
        self.ring
            .lock()
            .as_ref()
            .map(|ring| ring.snapshot_seconds(seconds))
            .unwrap_or_default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        *self.status.lock() = new_status;
        if let Some(detail) = &detail {
            *self.last_error.lock() = Some(detail.clone());
        }
        let _ = self.status_tx.send(EngineStatusEvent {
            status: new_status,
            detail,
        });
    }

    fn spawn_capture_worker(
        &self,
        ring: Arc<FrameRing>,
        open_tx: std::sync::mpsc::Sender<Result<CaptureInfo>>,
    ) {
        let config = self.config.audio.clone();
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);
        let level_tx = self.level_tx.clone();
        let device_name_slot = Arc::clone(&self.device_name);
        let last_error = Arc::clone(&self.last_error);
        let frame_seq = Arc::clone(&self.frame_seq);
        let level_seq = Arc::clone(&self.level_seq);
        let guard = WorkerGuard::register(&self.active_workers);

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut open_ack = Some(open_tx);
            let mut backoff = BACKOFF_MIN;

            let gain = config
                .input_gain_percent
                .map(|p| {
                    warn!(
                        percent = p,
                        "no mixer control available; applying input gain in software"
                    );
                    device::gain_for_percent(p)
                })
                .unwrap_or(1.0);

            // Supervised open/drain/reopen loop. The cpal stream is !Send,
            // so it lives and dies entirely inside this thread.
            while running.load(Ordering::SeqCst) {
                let (producer, consumer) = create_sample_ring();
                let signals = CaptureSignals::new(Arc::clone(&running));
                let request = CaptureRequest {
                    device_name: config.device_name.clone(),
                    sample_rate: config.sample_rate,
                    channels: config.channels,
                    gain,
                };

                match AudioCapture::open(producer, signals.clone(), &request) {
                    Ok(capture) => {
                        let info = CaptureInfo {
                            device_name: capture.device_name.clone(),
                            sample_rate: capture.sample_rate,
                            channels: capture.channels,
                        };
                        *device_name_slot.lock() = Some(info.device_name.clone());
                        if let Some(ack) = open_ack.take() {
                            let _ = ack.send(Ok(info.clone()));
                        }
                        backoff = BACKOFF_MIN;

                        drain_capture(DrainContext {
                            consumer,
                            signals: &signals,
                            sample_rate: info.sample_rate,
                            channels: info.channels,
                            chunk_samples: config.chunk_samples,
                            ring: &ring,
                            counters: &counters,
                            level_tx: &level_tx,
                            frame_seq: &frame_seq,
                            level_seq: &level_seq,
                            running: &running,
                        });

                        // Stream drops here, releasing the device on this thread.
                        drop(capture);

                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        counters.device_reopens.fetch_add(1, Ordering::Relaxed);
                        warn!("audio stream lost — reopening");
                    }
                    Err(e) => {
                        if let Some(ack) = open_ack.take() {
                            let _ = ack.send(Err(e));
                            return;
                        }
                        *last_error.lock() = Some(e.to_string());
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "device unavailable — retrying");
                        sleep_cancellable(backoff, &running);
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
            info!("capture worker stopped");
        });
    }

    fn spawn_evidence_worker(
        &self,
        ring: Arc<FrameRing>,
        info: &CaptureInfo,
    ) -> Option<crossbeam_channel::Sender<EvidenceMsg>> {
        let index = match EvidenceIndex::open(&self.config.evidence.directory) {
            Ok(index) => Arc::new(index),
            Err(e) => {
                error!(error = %e, "evidence index unavailable — recording disabled");
                *self.last_error.lock() = Some(e.to_string());
                return None;
            }
        };
        *self.index.lock() = Some(Arc::clone(&index));

        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = evidence::RecorderContext {
            config: self.config.evidence.clone(),
            ring,
            rx,
            running: Arc::clone(&self.running),
            device: DeviceMeta::for_device(&info.device_name, info.sample_rate, info.channels),
            index,
            counters: Arc::clone(&self.counters),
            last_error: Arc::clone(&self.last_error),
        };
        let guard = WorkerGuard::register(&self.active_workers);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            evidence::run(ctx);
        });
        Some(tx)
    }

    fn spawn_detector_worker(
        &self,
        ring: Arc<FrameRing>,
        evidence_tx: Option<crossbeam_channel::Sender<EvidenceMsg>>,
    ) -> Result<()> {
        let coarse = if self.config.coarse.enabled {
            let tagger = if self.coarse_degraded.load(Ordering::SeqCst) {
                None
            } else {
                self.tagger.clone()
            };
            Some(CoarseClassifier::new(&self.config.coarse, tagger))
        } else {
            None
        };

        let fine = if self.config.fine.enabled {
            let bank = self.label_bank.lock().clone().ok_or_else(|| {
                BarkError::ModelLoad {
                    stage: "fine",
                    message: "label bank missing — warm_up() did not run".into(),
                }
            })?;
            let encoder = self.encoder.clone().ok_or_else(|| BarkError::ModelLoad {
                stage: "fine",
                message: "no zero-shot encoder backend installed".into(),
            })?;
            Some(FineClassifier::new(&self.config.fine, encoder, bank))
        } else {
            None
        };

        let ctx = pipeline::PipelineContext {
            gate: EnergyGate::new(&self.config.energy_gate),
            coarse,
            fine,
            smoother: DecisionSmoother::new(
                &self.config.smoother,
                self.config.fine.bypass_threshold,
            ),
            doa: self
                .config
                .doa
                .enabled
                .then(|| DoaEstimator::new(&self.config.doa)),
            matcher: self.matcher.lock().clone(),
            running: Arc::clone(&self.running),
            event_tx: self.event_tx.clone(),
            telemetry_tx: self.telemetry_tx.clone(),
            fingerprint_tx: self.fingerprint_tx.clone(),
            evidence_tx,
            counters: Arc::clone(&self.counters),
            last_event: Arc::clone(&self.last_event),
            config: self.config.clone(),
            ring,
        };

        let guard = WorkerGuard::register(&self.active_workers);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            pipeline::run(ctx);
        });
        Ok(())
    }
}

/// Everything the capture drain loop needs.
struct DrainContext<'a> {
    consumer: SampleConsumer,
    signals: &'a CaptureSignals,
    sample_rate: u32,
    channels: u16,
    chunk_samples: usize,
    ring: &'a FrameRing,
    counters: &'a pipeline::PipelineCounters,
    level_tx: &'a broadcast::Sender<AudioLevelTick>,
    frame_seq: &'a AtomicU64,
    level_seq: &'a AtomicU64,
    running: &'a AtomicBool,
}

/// Drain the SPSC ring into timestamped frames until stop or stream loss.
fn drain_capture(mut ctx: DrainContext<'_>) {
    let channels = ctx.channels.max(1);
    let frame_len = ctx.chunk_samples * channels as usize;
    let mut scratch = vec![0f32; frame_len.max(4_096)];
    let mut pending: Vec<f32> = Vec::with_capacity(frame_len * 4);

    let mut level_sum_sq = 0f64;
    let mut level_peak = 0f32;
    let mut level_samples = 0usize;
    let mut last_level = Instant::now();

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            return;
        }
        if ctx.signals.stream_failed.load(Ordering::Acquire) {
            warn!("capture stream reported failure");
            return;
        }

        let n = ctx.consumer.pop_slice(&mut scratch);
        if n == 0 {
            std::thread::sleep(DRAIN_IDLE);
            continue;
        }
        ctx.counters.xrun_samples.store(
            ctx.signals.xrun_samples.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        pending.extend_from_slice(&scratch[..n]);

        while pending.len() >= frame_len {
            let samples: Vec<f32> = pending.drain(..frame_len).collect();

            for &s in &samples {
                level_sum_sq += f64::from(s) * f64::from(s);
                level_peak = level_peak.max(s.abs());
            }
            level_samples += samples.len();

            // Timestamp the frame's first sample: now, minus what is still
            // queued behind it (the undrained backlog plus this frame).
            let backlog_ticks = pending.len() / channels as usize + ctx.chunk_samples;
            let backlog =
                Duration::from_secs_f64(backlog_ticks as f64 / f64::from(ctx.sample_rate));
            let now = Instant::now();
            let t_monotonic = now.checked_sub(backlog).unwrap_or(now);
            let t_wall = chrono::Utc::now()
                - chrono::Duration::from_std(backlog).unwrap_or_else(|_| chrono::Duration::zero());

            ctx.ring.push(crate::buffering::AudioFrame {
                samples,
                channels,
                sample_rate: ctx.sample_rate,
                seq: ctx.frame_seq.fetch_add(1, Ordering::Relaxed),
                t_monotonic,
                t_wall,
            });
            ctx.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        }

        if last_level.elapsed() >= LEVEL_INTERVAL && level_samples > 0 {
            let tick = AudioLevelTick {
                seq: ctx.level_seq.fetch_add(1, Ordering::Relaxed),
                rms: (level_sum_sq / level_samples as f64).sqrt() as f32,
                peak: level_peak,
            };
            let _ = ctx.level_tx.send(tick);
            level_sum_sq = 0.0;
            level_peak = 0.0;
            level_samples = 0;
            last_level = Instant::now();
        }
    }
}

/// Sleep in small slices so cancellation stays responsive.
fn sleep_cancellable(total: Duration, running: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if !running.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::stub::{StubEncoder, StubTagger};

    fn engine() -> BarkEngine {
        BarkEngine::new(
            Config::default(),
            Some(TaggerHandle::new(StubTagger::new())),
            Some(EncoderHandle::new(StubEncoder::new())),
            None,
        )
        .expect("valid default config")
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = Config::default();
        config.smoother.window_size = 0;
        assert!(BarkEngine::new(config, None, None, None).is_err());
    }

    #[test]
    fn stop_without_start_errors() {
        let engine = engine();
        assert!(matches!(engine.stop(), Err(BarkError::NotRunning)));
    }

    #[test]
    fn warm_up_is_idempotent_and_caches_labels() {
        let engine = engine();
        engine.warm_up().expect("warm up");
        assert_eq!(engine.status(), EngineStatus::Idle);
        engine.warm_up().expect("second warm up");
        assert!(engine.label_bank.lock().is_some());
    }

    #[test]
    fn warm_up_without_encoder_is_fatal_when_fine_enabled() {
        let engine = BarkEngine::new(
            Config::default(),
            Some(TaggerHandle::new(StubTagger::new())),
            None,
            None,
        )
        .unwrap();
        assert!(engine.warm_up().is_err());
        assert_eq!(engine.status(), EngineStatus::Error);
    }

    #[test]
    fn warm_up_without_tagger_degrades_coarse_when_fallback_pass() {
        let engine = BarkEngine::new(
            Config::default(),
            None,
            Some(EncoderHandle::new(StubEncoder::new())),
            None,
        )
        .unwrap();
        engine.warm_up().expect("degraded warm up");
        assert!(engine.coarse_degraded.load(Ordering::SeqCst));
    }

    #[test]
    fn warm_up_without_tagger_is_fatal_when_fallback_block() {
        let mut config = Config::default();
        config.coarse.fallback_on_error = crate::config::FallbackMode::Block;
        let engine = BarkEngine::new(
            config,
            None,
            Some(EncoderHandle::new(StubEncoder::new())),
            None,
        )
        .unwrap();
        assert!(engine.warm_up().is_err());
    }

    #[test]
    fn status_snapshot_reflects_idle_engine() {
        let engine = engine();
        let snap = engine.status_snapshot();
        assert!(!snap.running);
        assert_eq!(snap.uptime_s, 0.0);
        assert_eq!(snap.counters.events_emitted, 0);
        assert!(snap.last_event.is_none());
    }
}
