//! Coarse classifier: cheap multi-label pre-filter.
//!
//! Wraps an [`AudioTagger`] and reduces its per-class scores to one
//! "dog-like" probability (max over the configured class indices). The
//! threshold is deliberately low — this stage sheds silence-adjacent and
//! clearly-unrelated windows before the expensive fine classifier runs,
//! and must not produce false negatives.
//!
//! Failure semantics: when no tagger is installed (load failed and
//! `fallback_on_error = pass`) the stage is degraded to always-pass. A
//! per-window runtime failure also passes the window, so the fine
//! classifier still sees it.

use tracing::warn;

use crate::config::CoarseConfig;
use crate::inference::TaggerHandle;
use crate::ipc::events::CoarseReading;

/// Pre-filter around a multi-label tagger.
pub struct CoarseClassifier {
    tagger: Option<TaggerHandle>,
    threshold: f32,
    dog_class_ids: Vec<usize>,
}

impl CoarseClassifier {
    /// `tagger = None` builds a degraded always-pass stage (the caller has
    /// already logged the one-shot warning when load failed).
    pub fn new(config: &CoarseConfig, tagger: Option<TaggerHandle>) -> Self {
        Self {
            tagger,
            threshold: config.threshold,
            dog_class_ids: config.dog_class_ids.clone(),
        }
    }

    /// Whether a real tagger is backing this stage.
    pub fn is_degraded(&self) -> bool {
        self.tagger.is_none()
    }

    /// Evaluate one mono window.
    ///
    /// Returns the observation plus an error flag for the tick counters;
    /// errors fail open.
    pub fn evaluate(&self, samples: &[f32], sample_rate: u32) -> (CoarseReading, bool) {
        let Some(tagger) = &self.tagger else {
            return (
                CoarseReading {
                    p_dog: 1.0,
                    passed: true,
                },
                false,
            );
        };

        let probs = match tagger.0.lock().probabilities(samples, sample_rate) {
            Ok(probs) => probs,
            Err(e) => {
                warn!(error = %e, "coarse tagger failed for this window; passing through");
                return (
                    CoarseReading {
                        p_dog: 1.0,
                        passed: true,
                    },
                    true,
                );
            }
        };

        let p_dog = self
            .dog_class_ids
            .iter()
            .filter_map(|&idx| probs.get(idx))
            .copied()
            .fold(0f32, f32::max);

        (
            CoarseReading {
                p_dog,
                passed: p_dog >= self.threshold,
            },
            false,
        )
    }
}
