//! End-to-end scenarios: a scripted audio producer feeds the frame ring in
//! pseudo-real-time while the detector and evidence workers run on
//! threads, exactly as the supervisor wires them — minus the sound card.
//!
//! Phase durations are compressed relative to a live deployment so the
//! suite stays in CI budgets; cadences (10 ms frames, 500 ms ticks) are
//! the production defaults.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use barkwatch_core::buffering::{AudioFrame, FrameRing};
use barkwatch_core::config::{Config, WavSampleFormat};
use barkwatch_core::detect::fine::LabelBank;
use barkwatch_core::detect::{CoarseClassifier, DecisionSmoother, EnergyGate, FineClassifier};
use barkwatch_core::doa::DoaEstimator;
use barkwatch_core::engine::pipeline::{self, PipelineContext, PipelineCounters};
use barkwatch_core::evidence::{self, DeviceMeta, EvidenceIndex, RecorderContext};
use barkwatch_core::inference::stub::{StubEncoder, StubTagger};
use barkwatch_core::inference::{EncoderHandle, TaggerHandle};
use barkwatch_core::ipc::events::{BarkEvent, PipelineStageTelemetry};

const SR: u32 = 44_100;
const CHUNK: usize = 441;

/// One segment of the scripted input stream.
#[derive(Debug, Clone, Copy)]
struct Phase {
    seconds: f64,
    freq: f32,
    amplitude: f32,
    /// Inter-channel delay as a source bearing, for DoA scenarios.
    bearing_deg: Option<f32>,
}

impl Phase {
    fn silence(seconds: f64) -> Self {
        Self {
            seconds,
            freq: 0.0,
            amplitude: 0.0,
            bearing_deg: None,
        }
    }

    fn tone(seconds: f64, freq: f32, amplitude: f32) -> Self {
        Self {
            seconds,
            freq,
            amplitude,
            bearing_deg: None,
        }
    }
}

/// Push one 10 ms stereo frame per 10 ms of wall time; silence after the
/// script runs out, until `running` clears.
fn spawn_producer(
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    phases: Vec<Phase>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let start = Instant::now();
        let mut seq = 0u64;
        loop {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let due = start + Duration::from_millis(seq * 10);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }

            let t_frame = seq as f64 * 0.01;
            let mut elapsed = 0.0;
            let mut current: Option<&Phase> = None;
            for phase in &phases {
                if t_frame < elapsed + phase.seconds {
                    current = Some(phase);
                    break;
                }
                elapsed += phase.seconds;
            }

            let (freq, amplitude, bearing) = match current {
                Some(p) => (p.freq, p.amplitude, p.bearing_deg),
                None => (0.0, 0.0, None),
            };
            let delay_s = bearing
                .map(|b| 0.5 * b.to_radians().cos() / freq.max(1.0))
                .unwrap_or(0.0);

            let mut samples = Vec::with_capacity(CHUNK * 2);
            for i in 0..CHUNK {
                let t = t_frame + i as f64 / SR as f64;
                let left = amplitude * (2.0 * std::f32::consts::PI * freq * t as f32).sin();
                let right = amplitude
                    * (2.0 * std::f32::consts::PI * freq * (t as f32 - delay_s)).sin();
                samples.push(left);
                samples.push(right);
            }
            ring.push(AudioFrame {
                samples,
                channels: 2,
                sample_rate: SR,
                seq,
                t_monotonic: due,
                t_wall: Utc::now(),
            });
            seq += 1;
        }
    })
}

struct Rig {
    running: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    event_rx: broadcast::Receiver<BarkEvent>,
    telemetry_rx: broadcast::Receiver<PipelineStageTelemetry>,
    index: Arc<EvidenceIndex>,
    workers: Vec<JoinHandle<()>>,
}

impl Rig {
    /// Wire producer + detector + evidence over one ring, stub backends.
    fn launch(mut config: Config, phases: Vec<Phase>, evidence_dir: &std::path::Path) -> Self {
        // Stub tagger class layout, short evidence contexts for CI.
        config.coarse.dog_class_ids = vec![1, 2];
        config.evidence.directory = evidence_dir.to_path_buf();
        config.evidence.past_context_seconds = 1.0;
        config.evidence.future_context_seconds = 1.0;
        config.evidence.sample_format = WavSampleFormat::Pcm16;

        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(PipelineCounters::default());
        let ring = Arc::new(FrameRing::with_duration(30.0, SR, CHUNK));

        let producer = spawn_producer(Arc::clone(&ring), Arc::clone(&running), phases);

        let index = Arc::new(EvidenceIndex::open(evidence_dir).expect("open index"));
        let (evidence_tx, evidence_rx) = crossbeam_channel::unbounded();
        let recorder_ctx = RecorderContext {
            config: config.evidence.clone(),
            ring: Arc::clone(&ring),
            rx: evidence_rx,
            running: Arc::clone(&running),
            device: DeviceMeta {
                hostname: "scenario".into(),
                microphone_name: "scripted".into(),
                sample_rate: SR,
                channels: 2,
            },
            index: Arc::clone(&index),
            counters: Arc::clone(&counters),
            last_error: Arc::new(Mutex::new(None)),
        };
        let recorder = thread::spawn(move || evidence::run(recorder_ctx));

        let encoder = EncoderHandle::new(StubEncoder::new());
        let bank = Arc::new(LabelBank::build(&config.fine, &encoder).expect("label bank"));
        let (event_tx, event_rx) = broadcast::channel(64);
        let (telemetry_tx, telemetry_rx) = broadcast::channel(1024);
        let (fingerprint_tx, _) = broadcast::channel(64);

        let ctx = PipelineContext {
            gate: EnergyGate::new(&config.energy_gate),
            coarse: Some(CoarseClassifier::new(
                &config.coarse,
                Some(TaggerHandle::new(StubTagger::new())),
            )),
            fine: Some(FineClassifier::new(&config.fine, encoder, bank)),
            smoother: DecisionSmoother::new(&config.smoother, config.fine.bypass_threshold),
            doa: Some(DoaEstimator::new(&config.doa)),
            matcher: None,
            running: Arc::clone(&running),
            event_tx,
            telemetry_tx,
            fingerprint_tx,
            evidence_tx: Some(evidence_tx),
            counters: Arc::clone(&counters),
            last_event: Arc::new(Mutex::new(None)),
            config,
            ring,
        };
        let detector = thread::spawn(move || pipeline::run(ctx));

        Self {
            running,
            counters,
            event_rx,
            telemetry_rx,
            index,
            workers: vec![producer, recorder, detector],
        }
    }

    fn shutdown(mut self) -> (Arc<PipelineCounters>, Arc<EvidenceIndex>) {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            worker.join().expect("worker panicked");
        }
        (self.counters, self.index)
    }

    fn drain_events(&mut self) -> Vec<BarkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

// ── S1: silent stream ───────────────────────────────────────────────────

#[test]
fn s1_silent_stream_emits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = Rig::launch(
        Config::default(),
        vec![Phase::silence(30.0)],
        dir.path(),
    );

    thread::sleep(Duration::from_millis(2_600));
    let events = rig.drain_events();
    let (counters, index) = rig.shutdown();

    assert!(events.is_empty(), "silence produced events: {events:?}");
    let snap = counters.snapshot();
    assert!(snap.vad_skipped >= 2, "vad_skipped = {}", snap.vad_skipped);
    assert_eq!(snap.events_emitted, 0);
    assert_eq!(index.len(), 0, "no evidence for silence");
}

// ── S2: single bark in quiet background ─────────────────────────────────

#[test]
fn s2_single_bark_produces_one_event_and_one_clip() {
    let dir = tempfile::tempdir().unwrap();
    // Quiet mid-band background passes the gate but scores as neither bark
    // nor veto. The bark is shorter than the analysis window so it has
    // left the window by the time cooldown expires.
    let background = Phase::tone(2.0, 2_000.0, 0.05);
    let bark = Phase::tone(0.6, 800.0, 0.5);
    let rig = Rig::launch(
        Config::default(),
        vec![background, bark, Phase::tone(4.0, 2_000.0, 0.05)],
        dir.path(),
    );

    // Background (2 s) + bark + future context + slack.
    thread::sleep(Duration::from_millis(6_500));
    let mut rig = rig;
    let events = rig.drain_events();
    let (counters, index) = rig.shutdown();

    assert_eq!(events.len(), 1, "expected exactly one event: {events:?}");
    let event = &events[0];
    assert!(
        event.probability >= 0.5,
        "probability {} below threshold",
        event.probability
    );
    assert_eq!(event.top_label, "dog barking");

    assert_eq!(index.len(), 1, "expected exactly one clip");
    let entry = &index.all()[0];
    let expected = 2.0; // past + future context
    assert!(
        (entry.record.duration_seconds - expected).abs() <= 1.0,
        "clip duration {} not within ±1 s of {expected}",
        entry.record.duration_seconds
    );
    assert!(!entry.record.truncated);

    // Exactly one WAV + one JSON with the shared basename, both indexed.
    let wav = dir.path().join(&entry.record.filename);
    assert!(wav.exists());
    assert!(wav.with_extension("json").exists());
    assert!(counters.snapshot().evidence_written == 1);
}

// ── S3: speech-only stream ──────────────────────────────────────────────

#[test]
fn s3_speech_stream_is_vetoed_every_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    // The coarse pre-filter would shed speech outright; open it so the
    // veto logic is what rejects.
    config.coarse.threshold = 0.0;

    let mut rig = Rig::launch(
        config,
        vec![Phase::tone(30.0, 150.0, 0.5)],
        dir.path(),
    );

    thread::sleep(Duration::from_millis(2_600));
    let events = rig.drain_events();

    let mut fine_ticks = 0;
    while let Ok(telemetry) = rig.telemetry_rx.try_recv() {
        if !telemetry.gate.passed {
            continue;
        }
        let Some(fine) = telemetry.fine else { continue };
        fine_ticks += 1;
        assert!(fine.vetoed, "speech tick not vetoed");
        assert!(
            fine.veto_scores.speech > fine.p_bark,
            "speech veto {} must exceed p_bark {}",
            fine.veto_scores.speech,
            fine.p_bark
        );
    }
    let (_counters, index) = rig.shutdown();

    assert!(events.is_empty(), "speech produced events");
    assert!(fine_ticks >= 2, "expected gated-in fine ticks");
    assert_eq!(index.len(), 0);
}

// ── S4: rapid double bark ───────────────────────────────────────────────

#[test]
fn s4_rapid_double_bark_merges_into_one_clip() {
    let dir = tempfile::tempdir().unwrap();
    // Both barks plus the 1 s analysis window fit inside the cooldown, so
    // the pair can only ever produce one event.
    let mut config = Config::default();
    config.smoother.cooldown_frames = 3;

    let background = Phase::tone(1.5, 2_000.0, 0.05);
    let rig = Rig::launch(
        config,
        vec![
            background,
            Phase::tone(0.3, 800.0, 0.4),
            Phase::tone(0.3, 2_000.0, 0.05),
            Phase::tone(0.3, 800.0, 0.6),
            Phase::tone(4.0, 2_000.0, 0.05),
        ],
        dir.path(),
    );

    thread::sleep(Duration::from_millis(7_000));
    let mut rig = rig;
    let events = rig.drain_events();
    let (_counters, index) = rig.shutdown();

    // The second bark falls inside the ~1 s cooldown: one event only.
    assert_eq!(events.len(), 1, "cooldown should swallow the second bark");

    assert_eq!(index.len(), 1, "both barks belong to one clip");
    let entry = &index.all()[0];
    assert!(
        entry.record.bark_count_in_clip >= 2,
        "clip should count both barks, got {}",
        entry.record.bark_count_in_clip
    );
    assert!(
        entry.record.peak_probability >= events[0].probability,
        "peak must cover the louder bark"
    );
}

// ── S5: stereo bark with synthetic bearing ──────────────────────────────

#[test]
fn s5_stereo_bark_carries_front_left_doa() {
    let dir = tempfile::tempdir().unwrap();
    let bark = Phase {
        seconds: 1.5,
        freq: 800.0,
        amplitude: 0.5,
        bearing_deg: Some(45.0),
    };
    let mut rig = Rig::launch(
        Config::default(),
        vec![Phase::tone(1.5, 2_000.0, 0.05), bark, Phase::silence(3.0)],
        dir.path(),
    );

    thread::sleep(Duration::from_millis(4_000));
    let events = rig.drain_events();
    rig.shutdown();

    assert!(!events.is_empty(), "expected a bark event");
    let doa = events[0].doa.expect("stereo stream must carry DoA");
    let bartlett = doa.bartlett.expect("bartlett estimate");
    assert!(
        (30.0..=60.0).contains(&bartlett),
        "bartlett {bartlett} outside [30, 60]"
    );
    assert_eq!(
        doa.direction_bucket,
        barkwatch_core::ipc::events::DirectionBucket::FrontLeft
    );
}

// ── S6: slow subscriber never blocks the pipeline ───────────────────────

#[test]
fn s6_slow_subscriber_lags_out_while_pipeline_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    // Emit on every accepted tick: no cooldown, no majority requirement.
    config.smoother.cooldown_frames = 0;
    config.fine.bypass_threshold = 0.0;

    let rig = Rig::launch(
        config,
        vec![Phase::tone(1.2, 2_000.0, 0.05), Phase::tone(30.0, 800.0, 0.5)],
        dir.path(),
    );

    // A subscriber that never reads: with the channel holding only a
    // bounded backlog, it simply lags; the detector's send never blocks.
    thread::sleep(Duration::from_millis(4_200));
    let mut rig = rig;
    rig.running.store(false, Ordering::SeqCst);
    for worker in rig.workers.drain(..) {
        worker.join().expect("worker panicked");
    }
    let events = rig.drain_events();

    let emitted = rig.counters.snapshot().events_emitted;
    assert!(emitted >= 5, "pipeline stalled: only {emitted} events");
    assert_eq!(events.len() as u64, emitted, "fan-out lost events");
    assert!(rig.index.len() >= 1, "evidence must keep flowing");
}
