//! Event types emitted by the detection pipeline.
//!
//! | Event | Channel |
//! |-------|---------|
//! | `BarkEvent` | supervisor `subscribe_events()` |
//! | `PipelineStageTelemetry` | supervisor `subscribe_telemetry()` |
//! | `AudioLevelTick` | supervisor `subscribe_levels()` |
//! | `EngineStatusEvent` | supervisor `subscribe_status()` |
//! | `Fingerprint` | supervisor `subscribe_fingerprints()` |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Bark events
// ---------------------------------------------------------------------------

/// Discrete, de-bounced detection. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarkEvent {
    pub event_id: Uuid,
    /// Wall-clock time of the window that triggered the emission.
    pub t_event: DateTime<Utc>,
    /// `p_bark` of the triggering window, in [0, 1].
    pub probability: f32,
    /// Highest-scoring label across the whole label set.
    pub top_label: String,
    /// Per-group veto score maxima for the triggering window.
    pub veto_scores: VetoScores,
    /// Bearing estimates; `None` when the stream has < 2 channels or DoA
    /// is disabled.
    pub doa: Option<DoaEstimate>,
    /// Frame range of the triggering window in the capture stream.
    pub audio_window_ref: AudioWindowRef,
}

/// Max score per veto group for one fine-classifier evaluation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VetoScores {
    pub speech: f32,
    pub percussive: f32,
    pub bird: f32,
}

/// Capture-stream coordinates of an event's audio window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioWindowRef {
    /// First frame sequence number included in the window.
    pub seq_start: u64,
    /// Last frame sequence number included in the window.
    pub seq_end: u64,
}

/// Quantized bearing, five bins across the scan range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectionBucket {
    Left,
    FrontLeft,
    Front,
    FrontRight,
    Right,
}

/// Direction-of-arrival estimates in degrees.
///
/// A method disabled in configuration reports `None`; the first configured
/// method is canonical and feeds `direction_bucket`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DoaEstimate {
    pub bartlett: Option<f32>,
    pub capon: Option<f32>,
    pub mem: Option<f32>,
    pub direction_bucket: DirectionBucket,
}

impl DoaEstimate {
    /// Bearing of the first method that produced an estimate.
    pub fn canonical(&self) -> Option<f32> {
        self.bartlett.or(self.capon).or(self.mem)
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Smoother stage, reported per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStage {
    /// Not running (terminal state on shutdown).
    Idle,
    /// Window not yet filled.
    Priming,
    /// Ready to emit.
    Armed,
    /// Suppressing emissions after an event.
    Cooldown,
}

/// Energy gate observation for one evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GateReading {
    pub passed: bool,
    pub level_db: f32,
    pub threshold_db: f32,
}

/// Coarse classifier observation for one tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoarseReading {
    /// Max probability over the configured dog-like classes.
    pub p_dog: f32,
    pub passed: bool,
}

/// Fine classifier observation for one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineReading {
    pub p_bark: f32,
    pub top_label: String,
    pub veto_scores: VetoScores,
    /// Tentative accept after veto rules and threshold.
    pub accepted: bool,
    /// Whether a veto rule rejected the window.
    pub vetoed: bool,
}

/// Per-tick stage telemetry. Stages that did not run this tick are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStageTelemetry {
    pub seq: u64,
    pub t: DateTime<Utc>,
    pub gate: GateReading,
    pub coarse: Option<CoarseReading>,
    pub fine: Option<FineReading>,
    pub decision: DecisionStage,
}

/// ~10 Hz VU meter sample from the capture worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioLevelTick {
    pub seq: u64,
    /// Root-mean-square level in [0, 1].
    pub rms: f32,
    /// Absolute peak level in [0, 1].
    pub peak: f32,
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Scalar acoustic features summarising one event window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryFeatures {
    /// Length of the continuous positive run behind the event.
    pub duration_ms: u32,
    /// Fundamental pitch; `None` when the window is unvoiced.
    pub pitch_hz: Option<f32>,
    pub spectral_centroid_hz: f32,
}

/// Per-event descriptor emitted to the external dog catalog.
///
/// `dog_id` / `match_confidence` are filled by the matcher when a centroid
/// is close enough; `rejection_reason` belongs to the external curation
/// layer and is always `None` at emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub fp_id: Uuid,
    pub event_id: Uuid,
    pub embedding: Vec<f32>,
    pub summary_features: SummaryFeatures,
    pub dog_id: Option<String>,
    pub match_confidence: Option<f32>,
    pub rejection_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine status
// ---------------------------------------------------------------------------

/// Emitted when the engine state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

/// Current state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Warming up models (loading weights, caching label embeddings).
    WarmingUp,
    /// Actively capturing and detecting.
    Listening,
    /// Capture stopped; engine may be restarted.
    Stopped,
    /// Unrecoverable error — restart required.
    Error,
}

/// Counter block exposed on the status snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub frames_in: u64,
    pub ticks: u64,
    pub vad_skipped: u64,
    pub coarse_skipped: u64,
    pub fine_runs: u64,
    pub events_emitted: u64,
    pub underruns: u64,
    pub inference_errors: u64,
    pub xrun_samples: u64,
    pub device_reopens: u64,
    pub evidence_written: u64,
    pub evidence_errors: u64,
}

/// Reference to the most recent emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastEventRef {
    pub event_id: Uuid,
    pub t_event: DateTime<Utc>,
}

/// Point-in-time supervisor status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub uptime_s: f64,
    pub counters: CountersSnapshot,
    pub last_event: Option<LastEventRef>,
    pub device_name: Option<String>,
    /// Most recent transient error string, if any.
    pub last_error: Option<String>,
}

/// Convenience: veto scores as a label→score map (sidecar shape).
impl VetoScores {
    pub fn as_map(&self) -> BTreeMap<String, f32> {
        BTreeMap::from([
            ("speech".to_string(), self.speech),
            ("percussive".to_string(), self.percussive),
            ("bird".to_string(), self.bird),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bark_event_serializes_with_snake_case_fields() {
        let event = BarkEvent {
            event_id: Uuid::nil(),
            t_event: Utc::now(),
            probability: 0.91,
            top_label: "dog barking".into(),
            veto_scores: VetoScores {
                speech: 0.05,
                percussive: 0.01,
                bird: 0.02,
            },
            doa: Some(DoaEstimate {
                bartlett: Some(45.0),
                capon: Some(44.0),
                mem: Some(47.5),
                direction_bucket: DirectionBucket::FrontLeft,
            }),
            audio_window_ref: AudioWindowRef {
                seq_start: 10,
                seq_end: 109,
            },
        };

        let json = serde_json::to_value(&event).expect("serialize bark event");
        assert_eq!(json["top_label"], "dog barking");
        assert_eq!(json["veto_scores"]["speech"], 0.05f32);
        assert_eq!(json["doa"]["direction_bucket"], "front-left");
        assert_eq!(json["audio_window_ref"]["seq_start"], 10);

        let round_trip: BarkEvent =
            serde_json::from_value(json).expect("deserialize bark event");
        assert_eq!(round_trip.audio_window_ref.seq_end, 109);
        assert_eq!(
            round_trip.doa.unwrap().direction_bucket,
            DirectionBucket::FrontLeft
        );
    }

    #[test]
    fn doa_none_serializes_as_null() {
        let event = BarkEvent {
            event_id: Uuid::nil(),
            t_event: Utc::now(),
            probability: 0.6,
            top_label: "dog barking".into(),
            veto_scores: VetoScores::default(),
            doa: None,
            audio_window_ref: AudioWindowRef {
                seq_start: 0,
                seq_end: 0,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["doa"].is_null());
    }

    #[test]
    fn decision_stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(DecisionStage::Cooldown).unwrap(),
            serde_json::json!("cooldown")
        );
    }

    #[test]
    fn canonical_bearing_prefers_bartlett() {
        let doa = DoaEstimate {
            bartlett: Some(10.0),
            capon: Some(20.0),
            mem: None,
            direction_bucket: DirectionBucket::Left,
        };
        assert_eq!(doa.canonical(), Some(10.0));

        let doa = DoaEstimate {
            bartlett: None,
            capon: Some(20.0),
            mem: None,
            direction_bucket: DirectionBucket::Left,
        };
        assert_eq!(doa.canonical(), Some(20.0));
    }

    #[test]
    fn veto_scores_map_has_all_groups() {
        let map = VetoScores {
            speech: 0.1,
            percussive: 0.2,
            bird: 0.3,
        }
        .as_map();
        assert_eq!(map.len(), 3);
        assert!((map["percussive"] - 0.2).abs() < 1e-6);
    }
}
