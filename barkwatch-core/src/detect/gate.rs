//! Energy gate: rejects quiet windows by dB-RMS threshold.
//!
//! First stage of the cascade. Runs on every tick over the ~1 s snapshot
//! and costs well under a millisecond, so the two classifier stages only
//! ever see windows with actual signal in them.

use crate::config::GateConfig;
use crate::detect::rms;
use crate::ipc::events::GateReading;

/// dB floor reported for silent windows.
const SILENCE_DB: f32 = -120.0;

/// RMS energy gate over a configurable window.
#[derive(Debug, Clone)]
pub struct EnergyGate {
    enabled: bool,
    threshold_db: f32,
}

impl EnergyGate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold_db: config.threshold_db,
        }
    }

    /// Evaluate one mono window. Every evaluation is observable: the
    /// reading carries the measured level even when the gate is disabled.
    pub fn evaluate(&self, samples: &[f32]) -> GateReading {
        let level = rms(samples);
        let level_db = if level > 0.0 {
            (20.0 * level.log10()).max(SILENCE_DB)
        } else {
            SILENCE_DB
        };

        GateReading {
            passed: !self.enabled || level_db >= self.threshold_db,
            level_db,
            threshold_db: self.threshold_db,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(threshold_db: f32) -> EnergyGate {
        EnergyGate::new(&GateConfig {
            enabled: true,
            threshold_db,
            window_seconds: 1.0,
        })
    }

    #[test]
    fn silence_is_rejected() {
        let reading = gate(-40.0).evaluate(&vec![0.0; 44_100]);
        assert!(!reading.passed);
        assert!((reading.level_db - (-120.0)).abs() < 1e-3);
    }

    #[test]
    fn loud_signal_passes() {
        // Constant 0.5 → RMS 0.5 → −6.02 dB.
        let reading = gate(-40.0).evaluate(&vec![0.5; 44_100]);
        assert!(reading.passed);
        assert!((reading.level_db - (-6.02)).abs() < 0.1);
    }

    #[test]
    fn quiet_signal_below_threshold_is_rejected() {
        // Constant 0.001 → −60 dB.
        let reading = gate(-40.0).evaluate(&vec![0.001; 44_100]);
        assert!(!reading.passed);
        assert!((reading.level_db - (-60.0)).abs() < 0.1);
    }

    #[test]
    fn infinite_threshold_rejects_everything() {
        let reading = gate(f32::INFINITY).evaluate(&vec![1.0; 1_000]);
        assert!(!reading.passed);
    }

    #[test]
    fn disabled_gate_always_passes() {
        let gate = EnergyGate::new(&GateConfig {
            enabled: false,
            threshold_db: -40.0,
            window_seconds: 1.0,
        });
        let reading = gate.evaluate(&vec![0.0; 1_000]);
        assert!(reading.passed);
    }
}
