//! Decision smoother: rolling-window majority + high-confidence bypass +
//! cooldown.
//!
//! Owns the pipeline's only mutable decision state. One update per
//! detector tick:
//!
//! - **Majority rule**: emit when at least M of the last N tentative
//!   decisions are accepts.
//! - **High-confidence bypass**: emit when the current `p_bark` reaches the
//!   bypass threshold, regardless of window fill.
//! - **Cooldown**: after an emission, updates still advance the window but
//!   cannot emit for `cooldown_frames` ticks. A continuous bark de-bounces
//!   into one event; distinct barks after cooldown emit again.
//!
//! State machine: `Idle → Priming → Armed → (Emit → Cooldown → Armed)`,
//! `Idle` again on reset at shutdown.

use crate::config::SmootherConfig;
use crate::ipc::events::DecisionStage;

/// Rolling decision state. Single owner: the detector worker.
#[derive(Debug)]
pub struct DecisionSmoother {
    window_size: usize,
    required_positives: usize,
    cooldown_frames: u32,
    bypass_threshold: f32,
    /// Bit ring of the last `window_size` decisions (LSB = newest).
    window: u64,
    filled: usize,
    cooldown_remaining: u32,
    stage: DecisionStage,
    /// Consecutive accepts including the current tick.
    positive_run: u32,
}

impl DecisionSmoother {
    pub fn new(config: &SmootherConfig, bypass_threshold: f32) -> Self {
        Self {
            window_size: config.window_size.clamp(1, 64),
            required_positives: config.required_positives,
            cooldown_frames: config.cooldown_frames,
            bypass_threshold,
            window: 0,
            filled: 0,
            cooldown_remaining: 0,
            stage: DecisionStage::Idle,
            positive_run: 0,
        }
    }

    /// Record one tick's tentative decision; returns `true` when a
    /// BarkEvent must be emitted.
    pub fn update(&mut self, accepted: bool, p_bark: f32) -> bool {
        self.window = (self.window << 1) | u64::from(accepted);
        self.filled = (self.filled + 1).min(self.window_size);
        self.positive_run = if accepted { self.positive_run + 1 } else { 0 };

        if self.cooldown_remaining > 0 {
            self.cooldown_remaining -= 1;
            self.stage = if self.cooldown_remaining > 0 {
                DecisionStage::Cooldown
            } else {
                DecisionStage::Armed
            };
            return false;
        }

        self.stage = if self.filled < self.window_size {
            DecisionStage::Priming
        } else {
            DecisionStage::Armed
        };

        let mask = if self.window_size == 64 {
            u64::MAX
        } else {
            (1u64 << self.window_size) - 1
        };
        let positives = (self.window & mask).count_ones() as usize;

        let majority = accepted && positives >= self.required_positives;
        let bypass = accepted && p_bark >= self.bypass_threshold;

        if majority || bypass {
            self.cooldown_remaining = self.cooldown_frames;
            self.stage = if self.cooldown_frames > 0 {
                DecisionStage::Cooldown
            } else {
                DecisionStage::Armed
            };
            return true;
        }
        false
    }

    /// Current state-machine stage for telemetry.
    pub fn stage(&self) -> DecisionStage {
        self.stage
    }

    /// Length of the continuous accept run ending at the last update, in
    /// ticks. The fingerprint extractor derives event duration from this.
    pub fn positive_run_ticks(&self) -> u32 {
        self.positive_run
    }

    /// Terminal reset: back to `Idle` with no history.
    pub fn reset(&mut self) {
        self.window = 0;
        self.filled = 0;
        self.cooldown_remaining = 0;
        self.positive_run = 0;
        self.stage = DecisionStage::Idle;
    }
}
