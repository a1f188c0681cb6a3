//! Evidence recorder: durable clips with pre/post-trigger context.
//!
//! A dedicated I/O worker owns a crossbeam mailbox fed by the detector:
//!
//! - `Trigger` — an emitted BarkEvent. Opens a clip spanning
//!   `past_context` before the event through `future_context` after it.
//! - `Mark` — a positive window that did not emit (cooldown). Marks inside
//!   the open clip bump `bark_count_in_clip` and `peak_probability`, so a
//!   rapid double bark counts as two barks in one clip.
//!
//! Triggers landing inside the open clip's window merge into it; a trigger
//! beyond the window finishes the current clip and starts the next one
//! (clips may overlap on disk through their past context — no
//! back-extension).
//!
//! I/O failures drop that clip only; the detection pipeline is never
//! blocked. Cancellation is honoured between clips; an in-flight clip is
//! truncated to the audio captured so far and its sidecar says so.

pub mod index;
pub mod sidecar;

pub use index::{EvidenceIndex, IndexEntry};
pub use sidecar::{DetectionMeta, DeviceMeta, EvidenceRecord};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffering::FrameRing;
use crate::config::EvidenceConfig;
use crate::engine::pipeline::PipelineCounters;
use crate::error::Result;
use crate::ipc::events::BarkEvent;

/// Poll cadence while waiting out a clip's future context.
const WAIT_POLL: Duration = Duration::from_millis(50);
/// Idle mailbox poll cadence (checks the running flag).
const IDLE_POLL: Duration = Duration::from_millis(100);

/// A BarkEvent handed to the recorder, with its monotonic anchor.
#[derive(Debug, Clone)]
pub struct EvidenceJob {
    pub event: BarkEvent,
    /// Monotonic time of the event (end of the triggering window).
    pub t_monotonic: Instant,
    pub fp_id: Option<Uuid>,
    pub dog_id: Option<String>,
}

/// Mailbox messages from the detector worker.
#[derive(Debug, Clone)]
pub enum EvidenceMsg {
    Trigger(Box<EvidenceJob>),
    /// Accepted window suppressed by cooldown.
    Mark {
        t_monotonic: Instant,
        probability: f32,
    },
}

/// Everything the recorder worker needs.
pub struct RecorderContext {
    pub config: EvidenceConfig,
    pub ring: Arc<FrameRing>,
    pub rx: Receiver<EvidenceMsg>,
    pub running: Arc<AtomicBool>,
    pub device: DeviceMeta,
    pub index: Arc<EvidenceIndex>,
    pub counters: Arc<PipelineCounters>,
    pub last_error: Arc<Mutex<Option<String>>>,
}

/// Run the blocking recorder loop until cancellation (between clips) or
/// mailbox disconnect.
pub fn run(ctx: RecorderContext) {
    info!(directory = ?ctx.config.directory, "evidence recorder started");

    if let Err(e) = std::fs::create_dir_all(&ctx.config.directory) {
        error!(error = %e, "cannot create evidence directory — recorder disabled");
        *ctx.last_error.lock() = Some(format!("evidence directory: {e}"));
        return;
    }

    loop {
        match ctx.rx.recv_timeout(IDLE_POLL) {
            Ok(EvidenceMsg::Trigger(job)) => {
                let mut next = Some(*job);
                while let Some(job) = next.take() {
                    next = record_clip(&ctx, job);
                }
            }
            Ok(EvidenceMsg::Mark { .. }) => {
                // No open clip — a stray mark carries no evidence.
            }
            Err(RecvTimeoutError::Timeout) => {
                if !ctx.running.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(clips = ctx.index.len(), "evidence recorder stopped");
}

/// Outcome of folding one mailbox message into the open clip.
enum Merge {
    Folded,
    /// Trigger beyond the clip window — close this clip, open the next.
    Defer(EvidenceJob),
}

struct OpenClip {
    start: Instant,
    end: Instant,
    peak_probability: f32,
    bark_count: u32,
    event_ids: Vec<Uuid>,
}

impl OpenClip {
    fn fold(&mut self, msg: EvidenceMsg) -> Merge {
        match msg {
            EvidenceMsg::Trigger(job) => {
                if job.t_monotonic <= self.end {
                    debug!(event = %job.event.event_id, "merging follow-up event into open clip");
                    self.peak_probability = self.peak_probability.max(job.event.probability);
                    self.bark_count += 1;
                    self.event_ids.push(job.event.event_id);
                    Merge::Folded
                } else {
                    Merge::Defer(*job)
                }
            }
            EvidenceMsg::Mark {
                t_monotonic,
                probability,
            } => {
                if t_monotonic >= self.start && t_monotonic <= self.end {
                    self.bark_count += 1;
                    self.peak_probability = self.peak_probability.max(probability);
                }
                Merge::Folded
            }
        }
    }
}

/// Record one clip. Returns a deferred trigger when one arrived past the
/// clip's window while waiting.
fn record_clip(ctx: &RecorderContext, job: EvidenceJob) -> Option<EvidenceJob> {
    let past = Duration::from_secs_f32(ctx.config.past_context_seconds.max(0.0));
    let future = Duration::from_secs_f32(ctx.config.future_context_seconds.max(0.0));

    let start = job
        .t_monotonic
        .checked_sub(past)
        .unwrap_or(job.t_monotonic);
    let end = job.t_monotonic + future;

    let mut clip = OpenClip {
        start,
        end,
        peak_probability: job.event.probability,
        bark_count: 1,
        event_ids: vec![job.event.event_id],
    };
    let mut truncated = false;
    let mut deferred = None;

    // Wait for the ring to pass the clip end, folding merges in as they
    // arrive. Cancellation truncates; a deferred trigger means live audio
    // already reached past our end.
    'wait: loop {
        loop {
            match ctx.rx.try_recv() {
                Ok(msg) => {
                    if let Merge::Defer(next) = clip.fold(msg) {
                        deferred = Some(next);
                        break 'wait;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    truncated = !ring_caught_up(ctx, clip.end);
                    break 'wait;
                }
            }
        }

        if ring_caught_up(ctx, clip.end) {
            break;
        }
        if !ctx.running.load(Ordering::Relaxed) {
            truncated = true;
            break;
        }

        match ctx.rx.recv_timeout(WAIT_POLL) {
            Ok(msg) => {
                if let Merge::Defer(next) = clip.fold(msg) {
                    deferred = Some(next);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                truncated = !ring_caught_up(ctx, clip.end);
                break;
            }
        }
    }

    match write_clip(ctx, &job, &clip, truncated) {
        Ok(()) => {
            ctx.counters
                .evidence_written
                .fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(event = %job.event.event_id, error = %e, "dropping evidence clip");
            ctx.counters.evidence_errors.fetch_add(1, Ordering::Relaxed);
            *ctx.last_error.lock() = Some(e.to_string());
        }
    }

    deferred
}

fn ring_caught_up(ctx: &RecorderContext, end: Instant) -> bool {
    ctx.ring.latest_end().is_some_and(|t| t >= end)
}

fn write_clip(
    ctx: &RecorderContext,
    job: &EvidenceJob,
    clip: &OpenClip,
    truncated: bool,
) -> Result<()> {
    let effective_end = if truncated {
        ctx.ring
            .latest_end()
            .map_or(clip.end, |t| t.min(clip.end))
    } else {
        clip.end
    };

    let frames = ctx.ring.snapshot_between(clip.start, effective_end);
    let Some(first) = frames.first() else {
        return Err(crate::error::BarkError::RingUnderrun {
            wanted_samples: 1,
            available_samples: 0,
        });
    };
    let channels = first.channels;
    let sample_rate = first.sample_rate;

    let total: usize = frames.iter().map(|f| f.samples.len()).sum();
    let mut interleaved = Vec::with_capacity(total);
    for frame in &frames {
        // A device fallback mid-clip can change the layout; keep only the
        // dominant (initial) layout so the WAV header stays truthful.
        if frame.channels == channels && frame.sample_rate == sample_rate {
            interleaved.extend_from_slice(&frame.samples);
        }
    }

    let basename = sidecar::clip_basename(job.event.t_event, job.event.event_id);
    let (wav_path, json_path) = sidecar::clip_paths(&ctx.config.directory, &basename);

    sidecar::write_wav(
        &wav_path,
        &interleaved,
        channels,
        sample_rate,
        ctx.config.sample_format,
    )?;

    let duration_seconds =
        interleaved.len() as f64 / f64::from(channels.max(1)) / f64::from(sample_rate.max(1));
    let (timestamp_utc, timestamp_local) = sidecar::sidecar_timestamps(job.event.t_event);
    let record = EvidenceRecord {
        filename: format!("{basename}.wav"),
        timestamp_utc,
        timestamp_local,
        duration_seconds,
        peak_probability: clip.peak_probability,
        bark_count_in_clip: clip.bark_count,
        detection: DetectionMeta {
            probability: job.event.probability,
            top_label: job.event.top_label.clone(),
            veto_scores: job.event.veto_scores,
        },
        doa: job.event.doa,
        device: ctx.device.clone(),
        truncated,
        schema_version: sidecar::SCHEMA_VERSION,
    };

    if ctx.config.include_metadata {
        sidecar::write_sidecar(&json_path, &record)?;
    }

    ctx.index.append(IndexEntry {
        record,
        fp_id: job.fp_id,
        dog_id: job.dog_id.clone(),
        event_ids: clip.event_ids.clone(),
    })?;

    if truncated {
        warn!(
            file = %basename,
            duration_s = duration_seconds,
            "clip truncated by shutdown"
        );
    } else {
        info!(
            file = %basename,
            duration_s = format_args!("{duration_seconds:.1}"),
            barks = clip.bark_count,
            "evidence clip written"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::AudioFrame;
    use crate::config::WavSampleFormat;
    use crate::ipc::events::{AudioWindowRef, VetoScores};
    use chrono::Utc;
    use crossbeam_channel::unbounded;
    use std::thread;

    /// Ring pre-filled with `seconds` of stereo frames ending "now".
    fn filled_ring(seconds: f64, t0: Instant) -> Arc<FrameRing> {
        let ring = Arc::new(FrameRing::with_duration(60.0, 44_100, 441));
        let frames = (seconds / 0.01) as u64;
        for seq in 0..frames {
            ring.push(AudioFrame {
                samples: vec![0.25; 882],
                channels: 2,
                sample_rate: 44_100,
                seq,
                t_monotonic: t0 + Duration::from_millis(seq * 10),
                t_wall: Utc::now(),
            });
        }
        ring
    }

    fn job_at(t: Instant, probability: f32) -> EvidenceJob {
        EvidenceJob {
            event: BarkEvent {
                event_id: Uuid::new_v4(),
                t_event: Utc::now(),
                probability,
                top_label: "dog barking".into(),
                veto_scores: VetoScores::default(),
                doa: None,
                audio_window_ref: AudioWindowRef {
                    seq_start: 0,
                    seq_end: 0,
                },
            },
            t_monotonic: t,
            fp_id: Some(Uuid::new_v4()),
            dog_id: None,
        }
    }

    fn context(dir: &std::path::Path, ring: Arc<FrameRing>) -> (RecorderContext, crossbeam_channel::Sender<EvidenceMsg>, Arc<AtomicBool>) {
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = RecorderContext {
            config: EvidenceConfig {
                directory: dir.to_path_buf(),
                past_context_seconds: 1.0,
                future_context_seconds: 1.0,
                include_metadata: true,
                sample_format: WavSampleFormat::Pcm16,
            },
            ring,
            rx,
            running: Arc::clone(&running),
            device: DeviceMeta {
                hostname: "test".into(),
                microphone_name: "test mic".into(),
                sample_rate: 44_100,
                channels: 2,
            },
            index: Arc::new(EvidenceIndex::in_memory()),
            counters: Arc::new(PipelineCounters::default()),
            last_error: Arc::new(Mutex::new(None)),
        };
        (ctx, tx, running)
    }

    #[test]
    fn trigger_produces_wav_json_and_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Instant::now() - Duration::from_secs(10);
        let ring = filled_ring(10.0, t0);
        let (ctx, tx, _running) = context(dir.path(), ring);
        let index = Arc::clone(&ctx.index);
        let counters = Arc::clone(&ctx.counters);

        // Event 2 s before the newest frame: past + future context present.
        tx.send(EvidenceMsg::Trigger(Box::new(job_at(
            t0 + Duration::from_secs(8),
            0.7,
        ))))
        .unwrap();
        drop(tx);
        let handle = thread::spawn(move || run(ctx));
        handle.join().expect("recorder thread panicked");

        assert_eq!(index.len(), 1);
        assert_eq!(counters.evidence_written.load(Ordering::Relaxed), 1);
        let entry = &index.all()[0];
        assert!(!entry.record.truncated);
        assert_eq!(entry.record.bark_count_in_clip, 1);
        assert!((entry.record.duration_seconds - 2.0).abs() < 0.2);

        let wav = dir.path().join(&entry.record.filename);
        let json = wav.with_extension("json");
        assert!(wav.exists(), "missing {wav:?}");
        assert!(json.exists(), "missing {json:?}");

        // Sidecar round-trip equals the indexed record.
        let side: EvidenceRecord =
            serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(side.filename, entry.record.filename);
        assert_eq!(side.peak_probability, entry.record.peak_probability);
    }

    #[test]
    fn mark_in_window_bumps_count_and_peak() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Instant::now() - Duration::from_secs(10);
        let ring = filled_ring(10.0, t0);
        let (ctx, tx, _running) = context(dir.path(), ring);
        let index = Arc::clone(&ctx.index);

        let trigger_at = t0 + Duration::from_secs(8);
        tx.send(EvidenceMsg::Trigger(Box::new(job_at(trigger_at, 0.6))))
            .unwrap();
        tx.send(EvidenceMsg::Mark {
            t_monotonic: trigger_at + Duration::from_millis(300),
            probability: 0.9,
        })
        .unwrap();
        drop(tx);
        run(ctx);

        let entry = &index.all()[0];
        assert_eq!(entry.record.bark_count_in_clip, 2);
        assert!((entry.record.peak_probability - 0.9).abs() < 1e-6);
    }

    #[test]
    fn trigger_beyond_window_starts_second_clip() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Instant::now() - Duration::from_secs(20);
        let ring = filled_ring(20.0, t0);
        let (ctx, tx, _running) = context(dir.path(), ring);
        let index = Arc::clone(&ctx.index);

        tx.send(EvidenceMsg::Trigger(Box::new(job_at(
            t0 + Duration::from_secs(10),
            0.7,
        ))))
        .unwrap();
        tx.send(EvidenceMsg::Trigger(Box::new(job_at(
            t0 + Duration::from_secs(15),
            0.8,
        ))))
        .unwrap();
        drop(tx);
        run(ctx);

        assert_eq!(index.len(), 2);
        for entry in index.all() {
            assert_eq!(entry.record.bark_count_in_clip, 1);
        }
    }

    #[test]
    fn cancellation_truncates_in_flight_clip() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Instant::now() - Duration::from_secs(5);
        let ring = filled_ring(5.0, t0);
        let (ctx, tx, running) = context(dir.path(), ring);
        let index = Arc::clone(&ctx.index);

        // Future context reaches 1 s past the newest frame; the ring will
        // never catch up because nothing is producing.
        tx.send(EvidenceMsg::Trigger(Box::new(job_at(
            t0 + Duration::from_secs(5),
            0.7,
        ))))
        .unwrap();

        let handle = thread::spawn(move || run(ctx));
        thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::SeqCst);
        drop(tx);
        handle.join().expect("recorder thread panicked");

        assert_eq!(index.len(), 1);
        let entry = &index.all()[0];
        assert!(entry.record.truncated);
        assert!(entry.record.duration_seconds < 1.5);
    }

    #[test]
    fn unwritable_directory_disables_recorder() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the evidence directory should be: directory
        // creation fails and the recorder shuts itself down.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let t0 = Instant::now() - Duration::from_secs(10);
        let ring = filled_ring(10.0, t0);
        let (mut ctx, tx, _running) = context(dir.path(), ring);
        ctx.config.directory = blocked;
        let counters = Arc::clone(&ctx.counters);
        let index = Arc::clone(&ctx.index);

        tx.send(EvidenceMsg::Trigger(Box::new(job_at(
            t0 + Duration::from_secs(8),
            0.7,
        ))))
        .unwrap();
        drop(tx);
        run(ctx);

        assert_eq!(index.len(), 0);
        assert_eq!(counters.evidence_written.load(Ordering::Relaxed), 0);
    }
}
