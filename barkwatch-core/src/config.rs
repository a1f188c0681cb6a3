//! Typed configuration record for the detection pipeline.
//!
//! Every section derives serde with `deny_unknown_fields`, so a config
//! document carrying unrecognized keys is rejected at parse time. Numeric
//! ranges are checked once by [`Config::validate`] at startup; validation
//! failures are fatal, nothing re-validates on the hot path.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BarkError, Result};

/// Detector cadence when the fine classifier drives decisions.
const FINE_TICK_MS: u64 = 500;
/// Detector cadence in coarse-only (fast fallback) mode.
const FAST_TICK_MS: u64 = 80;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub audio: AudioConfig,
    pub energy_gate: GateConfig,
    pub coarse: CoarseConfig,
    pub fine: FineConfig,
    pub smoother: SmootherConfig,
    pub doa: DoaConfig,
    pub evidence: EvidenceConfig,
    pub fingerprint: FingerprintConfig,
}

/// Audio capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    /// Preferred input device: exact name first, case-insensitive substring
    /// otherwise. `None` selects the system default input.
    pub device_name: Option<String>,
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count. DoA needs ≥ 2.
    pub channels: u16,
    /// Per-channel samples per device chunk (~10 ms at 44.1 kHz).
    pub chunk_samples: usize,
    /// Input gain 0–100. Applied as software gain; the platform mixer is
    /// not touched (a warning notes this at startup).
    pub input_gain_percent: Option<u8>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 44_100,
            channels: 2,
            chunk_samples: 441,
            input_gain_percent: None,
        }
    }
}

/// Energy gate (stage C2) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    pub enabled: bool,
    /// dB-FS RMS threshold; frames below are skipped.
    pub threshold_db: f32,
    /// Evaluation window in seconds.
    pub window_seconds: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_db: -40.0,
            window_seconds: 1.0,
        }
    }
}

/// What a stage does when its model fails to load or errors at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Degrade to always-pass so downstream stages still see the window.
    Pass,
    /// Refuse to start (load) / reject the window (runtime).
    Block,
}

/// Coarse classifier (stage C3) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoarseConfig {
    pub enabled: bool,
    /// Minimum max-probability across `dog_class_ids` to pass. Low on
    /// purpose: this stage exists to shed obvious negatives cheaply.
    pub threshold: f32,
    /// Tagger class indices treated as dog-like. Defaults to the AudioSet
    /// "Dog" (69) and "Bark" (70) classes.
    pub dog_class_ids: Vec<usize>,
    pub fallback_on_error: FallbackMode,
}

impl Default for CoarseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.05,
            dog_class_ids: vec![69, 70],
            fallback_on_error: FallbackMode::Pass,
        }
    }
}

/// Per-veto-group score thresholds for the fine classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VetoThresholds {
    pub speech: f32,
    pub percussive: f32,
    pub bird: f32,
}

impl Default for VetoThresholds {
    fn default() -> Self {
        Self {
            speech: 0.3,
            percussive: 0.3,
            bird: 0.3,
        }
    }
}

/// Fine zero-shot classifier (stage C4) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FineConfig {
    /// When false the detector runs coarse-only at the fast cadence.
    pub enabled: bool,
    /// Backend identifier, e.g. a CLAP export directory name.
    pub model_identifier: String,
    pub positive_labels: Vec<String>,
    pub speech_veto_labels: Vec<String>,
    pub percussive_veto_labels: Vec<String>,
    pub bird_veto_labels: Vec<String>,
    pub veto_thresholds: VetoThresholds,
    /// Minimum `p_bark` for a tentative accept.
    pub threshold: f32,
    /// `p_bark` at or above which the smoother emits without a majority.
    pub bypass_threshold: f32,
}

impl Default for FineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_identifier: "clap-htsat-fused".to_string(),
            positive_labels: vec!["dog barking".into(), "dog howling".into()],
            speech_veto_labels: vec!["person talking".into(), "shouting".into()],
            percussive_veto_labels: vec!["hand clap".into(), "door knock".into()],
            bird_veto_labels: vec!["bird chirping".into()],
            veto_thresholds: VetoThresholds::default(),
            threshold: 0.5,
            bypass_threshold: 0.8,
        }
    }
}

/// Decision smoother (stage C5) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmootherConfig {
    /// Rolling window length N.
    pub window_size: usize,
    /// Accepts required within the window (M of N).
    pub required_positives: usize,
    /// Ticks suppressed after an emission (~1 s at the fine cadence).
    pub cooldown_frames: u32,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            required_positives: 2,
            cooldown_frames: 2,
        }
    }
}

/// Beamforming algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoaMethod {
    Bartlett,
    Capon,
    Mem,
}

/// Direction-of-arrival (stage C6) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DoaConfig {
    pub enabled: bool,
    /// Uniform linear array element spacing, in wavelengths.
    pub element_spacing_wavelengths: f32,
    /// Array element count; capped at the captured channel count.
    pub num_elements: usize,
    /// Scan range in degrees.
    pub angle_min: f32,
    pub angle_max: f32,
    /// Algorithms to run; the first is canonical for the UI.
    pub methods: Vec<DoaMethod>,
}

impl Default for DoaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            element_spacing_wavelengths: 0.5,
            num_elements: 2,
            angle_min: 0.0,
            angle_max: 180.0,
            methods: vec![DoaMethod::Bartlett, DoaMethod::Capon, DoaMethod::Mem],
        }
    }
}

/// Evidence clip sample format on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavSampleFormat {
    Pcm16,
    Float32,
}

/// Evidence recorder (stage C7) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvidenceConfig {
    pub directory: PathBuf,
    /// Seconds of audio kept before the trigger.
    pub past_context_seconds: f32,
    /// Seconds of audio recorded after the trigger.
    pub future_context_seconds: f32,
    /// Whether the JSON sidecar is written alongside the clip.
    pub include_metadata: bool,
    pub sample_format: WavSampleFormat,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("evidence"),
            past_context_seconds: 15.0,
            future_context_seconds: 15.0,
            include_metadata: true,
            sample_format: WavSampleFormat::Pcm16,
        }
    }
}

/// When the fingerprint matcher rebuilds its centroid index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CentroidRefreshPolicy {
    OnChange,
    Periodic,
}

/// Fingerprint extractor/matcher (stage C8) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FingerprintConfig {
    /// Maximum cosine distance for a centroid match.
    pub match_threshold: f32,
    pub centroid_refresh_policy: CentroidRefreshPolicy,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.35,
            centroid_refresh_policy: CentroidRefreshPolicy::OnChange,
        }
    }
}

impl Config {
    /// Detector tick cadence: 500 ms with the fine classifier, 80 ms in
    /// coarse-only fast mode.
    pub fn detector_tick(&self) -> Duration {
        if self.fine.enabled {
            Duration::from_millis(FINE_TICK_MS)
        } else {
            Duration::from_millis(FAST_TICK_MS)
        }
    }

    /// Frame ring span: enough for a full clip, never less than 30 s.
    pub fn ring_seconds(&self) -> f64 {
        f64::from(self.evidence.past_context_seconds + self.evidence.future_context_seconds)
            .max(30.0)
    }

    /// Grace period granted to workers on stop.
    pub fn stop_grace(&self) -> Duration {
        self.detector_tick() * 2 + Duration::from_secs(1)
    }

    /// Check every numeric range once. Fatal at startup only.
    pub fn validate(&self) -> Result<()> {
        fn fail(message: impl Into<String>) -> Result<()> {
            Err(BarkError::ConfigValidation {
                message: message.into(),
            })
        }

        if self.audio.sample_rate == 0 {
            return fail("audio.sample_rate must be positive");
        }
        if self.audio.channels == 0 {
            return fail("audio.channels must be at least 1");
        }
        if self.audio.chunk_samples == 0 {
            return fail("audio.chunk_samples must be positive");
        }
        if let Some(gain) = self.audio.input_gain_percent {
            if gain > 100 {
                return fail(format!(
                    "audio.input_gain_percent must be 0-100, got {gain}"
                ));
            }
        }

        if self.energy_gate.window_seconds <= 0.0 {
            return fail("energy_gate.window_seconds must be positive");
        }

        if self.coarse.enabled {
            if !(0.0..=1.0).contains(&self.coarse.threshold) {
                return fail(format!(
                    "coarse.threshold must be in [0, 1], got {}",
                    self.coarse.threshold
                ));
            }
            if self.coarse.dog_class_ids.is_empty() {
                return fail("coarse.dog_class_ids must not be empty");
            }
        }

        if self.fine.enabled {
            if self.fine.positive_labels.is_empty() {
                return fail("fine.positive_labels must not be empty");
            }
            if !(0.0..=1.0).contains(&self.fine.threshold) {
                return fail(format!(
                    "fine.threshold must be in [0, 1], got {}",
                    self.fine.threshold
                ));
            }
            if self.fine.bypass_threshold < 0.0 {
                return fail("fine.bypass_threshold must be non-negative");
            }
            for (name, value) in [
                ("speech", self.fine.veto_thresholds.speech),
                ("percussive", self.fine.veto_thresholds.percussive),
                ("bird", self.fine.veto_thresholds.bird),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return fail(format!(
                        "fine.veto_thresholds.{name} must be in [0, 1], got {value}"
                    ));
                }
            }
        } else if !self.coarse.enabled {
            return fail("at least one of coarse and fine classifiers must be enabled");
        }

        if self.smoother.window_size == 0 || self.smoother.window_size > 64 {
            return fail(format!(
                "smoother.window_size must be in 1-64, got {}",
                self.smoother.window_size
            ));
        }
        if self.smoother.required_positives == 0
            || self.smoother.required_positives > self.smoother.window_size
        {
            return fail(format!(
                "smoother.required_positives must be in 1-{}, got {}",
                self.smoother.window_size, self.smoother.required_positives
            ));
        }

        if self.doa.enabled {
            if self.doa.element_spacing_wavelengths <= 0.0 {
                return fail("doa.element_spacing_wavelengths must be positive");
            }
            if self.doa.num_elements < 2 {
                return fail("doa.num_elements must be at least 2");
            }
            if self.doa.angle_min >= self.doa.angle_max {
                return fail("doa.angle_min must be below doa.angle_max");
            }
            if self.doa.methods.is_empty() {
                return fail("doa.methods must not be empty");
            }
        }

        if self.evidence.past_context_seconds < 0.0 || self.evidence.future_context_seconds < 0.0 {
            return fail("evidence context seconds must be non-negative");
        }

        if !(0.0..=1.0).contains(&self.fingerprint.match_threshold)
            || self.fingerprint.match_threshold == 0.0
        {
            return fail(format!(
                "fingerprint.match_threshold must be in (0, 1], got {}",
                self.fingerprint.match_threshold
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let parsed: std::result::Result<Config, _> =
            serde_json::from_str(r#"{"audio": {"sample_rate": 48000, "buffer_len": 4}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn rejects_zero_sample_rate() {
        let mut cfg = Config::default();
        cfg.audio.sample_rate = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_majority_larger_than_window() {
        let mut cfg = Config::default();
        cfg.smoother.window_size = 3;
        cfg.smoother.required_positives = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_veto_threshold() {
        let mut cfg = Config::default();
        cfg.fine.veto_thresholds.speech = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_both_classifiers_disabled() {
        let mut cfg = Config::default();
        cfg.coarse.enabled = false;
        cfg.fine.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tick_follows_fine_mode() {
        let mut cfg = Config::default();
        assert_eq!(cfg.detector_tick(), Duration::from_millis(500));
        cfg.fine.enabled = false;
        assert_eq!(cfg.detector_tick(), Duration::from_millis(80));
    }

    #[test]
    fn ring_seconds_never_below_thirty() {
        let mut cfg = Config::default();
        cfg.evidence.past_context_seconds = 5.0;
        cfg.evidence.future_context_seconds = 5.0;
        assert!((cfg.ring_seconds() - 30.0).abs() < 1e-9);
        cfg.evidence.past_context_seconds = 20.0;
        cfg.evidence.future_context_seconds = 20.0;
        assert!((cfg.ring_seconds() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_mode_parses_lowercase() {
        let cfg: Config =
            serde_json::from_str(r#"{"coarse": {"fallback_on_error": "block"}}"#).unwrap();
        assert_eq!(cfg.coarse.fallback_on_error, FallbackMode::Block);
    }
}
