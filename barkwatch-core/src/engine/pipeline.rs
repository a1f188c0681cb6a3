//! Blocking detector loop.
//!
//! ## Per tick
//!
//! ```text
//! 1. Snapshot ~1 s of frames off the ring (skip tick on underrun)
//! 2. Downmix to mono at the capture rate
//! 3. Energy gate → below threshold counts as a negative decision
//! 4. Coarse tagger → p_dog below threshold counts as a negative
//! 5. Fine zero-shot classifier → tentative accept/reject + embedding
//! 6. Smoother update → maybe emit
//! 7. On emit: DoA (multi-channel only) → BarkEvent + Fingerprint,
//!    broadcast + evidence trigger; accepted-but-cooled windows send
//!    evidence marks instead
//! 8. Telemetry broadcast, then sleep out the tick
//! ```
//!
//! The loop checks cancellation only at tick boundaries; inference calls
//! are not interruptible mid-call. The whole loop runs under
//! `spawn_blocking`, keeping the async executor free.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    buffering::{frame::downmix_mono, AudioFrame, FrameRing},
    config::Config,
    detect::{CoarseClassifier, DecisionSmoother, EnergyGate, FineClassifier},
    doa::DoaEstimator,
    evidence::{EvidenceJob, EvidenceMsg},
    fingerprint::{self, FingerprintMatcher},
    ipc::events::{
        AudioWindowRef, BarkEvent, CoarseReading, CountersSnapshot, FineReading, Fingerprint,
        LastEventRef, PipelineStageTelemetry, VetoScores,
    },
};

/// Shared pipeline counters. One writer per counter; readers snapshot.
#[derive(Default)]
pub struct PipelineCounters {
    pub frames_in: AtomicU64,
    pub ticks: AtomicU64,
    pub vad_skipped: AtomicU64,
    pub coarse_skipped: AtomicU64,
    pub fine_runs: AtomicU64,
    pub events_emitted: AtomicU64,
    pub underruns: AtomicU64,
    pub inference_errors: AtomicU64,
    pub xrun_samples: AtomicU64,
    pub device_reopens: AtomicU64,
    pub evidence_written: AtomicU64,
    pub evidence_errors: AtomicU64,
}

impl PipelineCounters {
    pub fn reset(&self) {
        self.frames_in.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.vad_skipped.store(0, Ordering::Relaxed);
        self.coarse_skipped.store(0, Ordering::Relaxed);
        self.fine_runs.store(0, Ordering::Relaxed);
        self.events_emitted.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.xrun_samples.store(0, Ordering::Relaxed);
        self.device_reopens.store(0, Ordering::Relaxed);
        self.evidence_written.store(0, Ordering::Relaxed);
        self.evidence_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            vad_skipped: self.vad_skipped.load(Ordering::Relaxed),
            coarse_skipped: self.coarse_skipped.load(Ordering::Relaxed),
            fine_runs: self.fine_runs.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            xrun_samples: self.xrun_samples.load(Ordering::Relaxed),
            device_reopens: self.device_reopens.load(Ordering::Relaxed),
            evidence_written: self.evidence_written.load(Ordering::Relaxed),
            evidence_errors: self.evidence_errors.load(Ordering::Relaxed),
        }
    }
}

/// All context the detector needs, passed as one struct so the closure
/// stays tidy.
pub struct PipelineContext {
    pub config: Config,
    pub ring: Arc<FrameRing>,
    pub gate: EnergyGate,
    /// `None` when the coarse stage is disabled in configuration.
    pub coarse: Option<CoarseClassifier>,
    /// `None` in coarse-only fast mode.
    pub fine: Option<FineClassifier>,
    pub smoother: DecisionSmoother,
    pub doa: Option<DoaEstimator>,
    pub matcher: Option<Arc<FingerprintMatcher>>,
    pub running: Arc<AtomicBool>,
    pub event_tx: broadcast::Sender<BarkEvent>,
    pub telemetry_tx: broadcast::Sender<PipelineStageTelemetry>,
    pub fingerprint_tx: broadcast::Sender<Fingerprint>,
    /// `None` when evidence recording is disabled or failed to initialise.
    pub evidence_tx: Option<crossbeam_channel::Sender<EvidenceMsg>>,
    pub counters: Arc<PipelineCounters>,
    pub last_event: Arc<Mutex<Option<LastEventRef>>>,
}

/// Minimum fraction of the analysis window a snapshot must cover; shorter
/// snapshots skip the tick as an underrun.
const MIN_WINDOW_FRACTION: f64 = 0.9;

/// Run the blocking detector loop until `ctx.running` becomes false.
pub fn run(mut ctx: PipelineContext) {
    let tick = ctx.config.detector_tick();
    info!(tick_ms = tick.as_millis() as u64, "detector started");

    let mut telemetry_seq = 0u64;

    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break;
        }

        let tick_start = Instant::now();
        process_tick(&mut ctx, &mut telemetry_seq);

        // Cancellation is only observed here, at the tick boundary.
        let elapsed = tick_start.elapsed();
        if elapsed < tick {
            std::thread::sleep(tick - elapsed);
        }
    }

    ctx.smoother.reset();

    let snap = ctx.counters.snapshot();
    info!(
        ticks = snap.ticks,
        vad_skipped = snap.vad_skipped,
        coarse_skipped = snap.coarse_skipped,
        fine_runs = snap.fine_runs,
        events_emitted = snap.events_emitted,
        underruns = snap.underruns,
        inference_errors = snap.inference_errors,
        "detector stopped — counters"
    );
}

fn process_tick(ctx: &mut PipelineContext, telemetry_seq: &mut u64) {
    ctx.counters.ticks.fetch_add(1, Ordering::Relaxed);

    let window_secs = f64::from(ctx.config.energy_gate.window_seconds);
    let frames = ctx.ring.snapshot_seconds(window_secs);
    let covered: f64 = frames.iter().map(|f| f.duration_secs()).sum();
    if frames.is_empty() || covered < window_secs * MIN_WINDOW_FRACTION {
        ctx.counters.underruns.fetch_add(1, Ordering::Relaxed);
        debug!(
            covered_s = covered,
            wanted_s = window_secs,
            "snapshot too short — skipping tick"
        );
        return;
    }

    let window = Window::stitch(&frames);
    let mono = downmix_mono(&window.interleaved, window.channels);

    // ── Stage C2: energy gate ────────────────────────────────────────────
    let gate = ctx.gate.evaluate(&mono);

    let mut coarse_reading: Option<CoarseReading> = None;
    let mut fine_reading: Option<FineReading> = None;
    let mut embedding: Option<Vec<f32>> = None;
    let mut accepted = false;
    let mut p_bark = 0f32;

    if !gate.passed {
        ctx.counters.vad_skipped.fetch_add(1, Ordering::Relaxed);
    } else {
        // ── Stage C3: coarse tagger ──────────────────────────────────────
        let coarse_passed = match &ctx.coarse {
            Some(coarse) => {
                let (reading, errored) = coarse.evaluate(&mono, window.sample_rate);
                if errored {
                    ctx.counters.inference_errors.fetch_add(1, Ordering::Relaxed);
                }
                let passed = reading.passed;
                if !passed {
                    ctx.counters.coarse_skipped.fetch_add(1, Ordering::Relaxed);
                }
                coarse_reading = Some(reading);
                passed
            }
            None => true,
        };

        if coarse_passed {
            // ── Stage C4: fine zero-shot classifier ──────────────────────
            match &ctx.fine {
                Some(fine) => {
                    ctx.counters.fine_runs.fetch_add(1, Ordering::Relaxed);
                    match fine.evaluate(&mono, window.sample_rate) {
                        Ok(decision) => {
                            accepted = decision.reading.accepted;
                            p_bark = decision.reading.p_bark;
                            fine_reading = Some(decision.reading);
                            embedding = Some(decision.embedding);
                        }
                        Err(e) => {
                            // Transient failure: fail open for this tick.
                            // The window still counts toward the smoother's
                            // majority, but with no score behind it the
                            // bypass path stays cold.
                            ctx.counters.inference_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "fine classifier failed for this tick; passing window through");
                            accepted = true;
                            p_bark = 0.0;
                        }
                    }
                }
                None => {
                    // Coarse-only fast mode: the tagger's verdict drives the
                    // smoother directly.
                    accepted = true;
                    p_bark = coarse_reading.map_or(1.0, |r| r.p_dog);
                }
            }
        }
    }

    // ── Stage C5: decision smoother (exactly one update per tick) ───────
    let emit = ctx.smoother.update(accepted, p_bark);

    if emit {
        emit_event(ctx, &window, &mono, p_bark, fine_reading.clone(), embedding);
    } else if accepted {
        // Accepted during cooldown: no event, but the open evidence clip
        // should count the bark.
        if let Some(tx) = &ctx.evidence_tx {
            let _ = tx.send(EvidenceMsg::Mark {
                t_monotonic: window.end_monotonic,
                probability: p_bark,
            });
        }
    }

    let telemetry = PipelineStageTelemetry {
        seq: *telemetry_seq,
        t: window.end_wall,
        gate,
        coarse: coarse_reading,
        fine: fine_reading,
        decision: ctx.smoother.stage(),
    };
    *telemetry_seq += 1;
    let _ = ctx.telemetry_tx.send(telemetry);
}

/// One stitched analysis window.
struct Window {
    interleaved: Vec<f32>,
    channels: u16,
    sample_rate: u32,
    seq_start: u64,
    seq_end: u64,
    end_monotonic: Instant,
    end_wall: chrono::DateTime<chrono::Utc>,
}

impl Window {
    fn stitch(frames: &[Arc<AudioFrame>]) -> Self {
        let first = &frames[0];
        let last = &frames[frames.len() - 1];
        let total: usize = frames.iter().map(|f| f.samples.len()).sum();
        let mut interleaved = Vec::with_capacity(total);
        for frame in frames {
            if frame.channels == first.channels && frame.sample_rate == first.sample_rate {
                interleaved.extend_from_slice(&frame.samples);
            }
        }
        let end_wall = last.t_wall
            + chrono::Duration::from_std(std::time::Duration::from_secs_f64(
                last.duration_secs(),
            ))
            .unwrap_or_else(|_| chrono::Duration::zero());

        Self {
            interleaved,
            channels: first.channels,
            sample_rate: first.sample_rate,
            seq_start: first.seq,
            seq_end: last.seq,
            end_monotonic: last.end_monotonic(),
            end_wall,
        }
    }
}

fn emit_event(
    ctx: &mut PipelineContext,
    window: &Window,
    mono: &[f32],
    p_bark: f32,
    fine_reading: Option<FineReading>,
    embedding: Option<Vec<f32>>,
) {
    ctx.counters.events_emitted.fetch_add(1, Ordering::Relaxed);

    // ── Stage C6: DoA, multi-channel streams only ────────────────────────
    let doa = match (&ctx.doa, window.channels >= 2) {
        (Some(estimator), true) => {
            estimator.estimate(&window.interleaved, window.channels, window.sample_rate)
        }
        _ => None,
    };

    let (top_label, veto_scores) = match &fine_reading {
        Some(reading) => (reading.top_label.clone(), reading.veto_scores),
        // No fine scores behind this emission (coarse-only mode, or the
        // window passed through a failed-open fine tick).
        None => ("dog-like".to_string(), VetoScores::default()),
    };

    let event = BarkEvent {
        event_id: Uuid::new_v4(),
        t_event: window.end_wall,
        probability: p_bark,
        top_label,
        veto_scores,
        doa,
        audio_window_ref: AudioWindowRef {
            seq_start: window.seq_start,
            seq_end: window.seq_end,
        },
    };

    info!(
        event_id = %event.event_id,
        probability = format_args!("{p_bark:.2}"),
        top_label = %event.top_label,
        doa = ?event.doa.as_ref().and_then(|d| d.canonical()),
        "bark event emitted"
    );

    // ── Stage C8: fingerprint (reuses the fine embedding) ────────────────
    let tick_ms = ctx.config.detector_tick().as_millis() as u32;
    let fingerprint = embedding.map(|emb| {
        fingerprint::extract(
            event.event_id,
            mono,
            window.sample_rate,
            ctx.smoother.positive_run_ticks().saturating_mul(tick_ms),
            emb,
            ctx.matcher.as_deref(),
        )
    });

    *ctx.last_event.lock() = Some(LastEventRef {
        event_id: event.event_id,
        t_event: event.t_event,
    });

    // ── Stage C7: evidence trigger ───────────────────────────────────────
    if let Some(tx) = &ctx.evidence_tx {
        let job = EvidenceJob {
            event: event.clone(),
            t_monotonic: window.end_monotonic,
            fp_id: fingerprint.as_ref().map(|fp| fp.fp_id),
            dog_id: fingerprint.as_ref().and_then(|fp| fp.dog_id.clone()),
        };
        let _ = tx.send(EvidenceMsg::Trigger(Box::new(job)));
    }

    // Fan-out last: subscribers observe events in emission order, and a
    // send to a channel with no receivers is not an error.
    let _ = ctx.event_tx.send(event);
    if let Some(fp) = fingerprint {
        let _ = ctx.fingerprint_tx.send(fp);
    }
}
