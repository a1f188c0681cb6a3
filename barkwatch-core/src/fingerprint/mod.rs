//! Fingerprint extraction: per-event descriptors for dog attribution.
//!
//! The embedding comes straight from the fine classifier's evaluation of
//! the same window — it is never recomputed here. This module only adds
//! the scalar summary features and the centroid match, then hands the
//! record to the supervisor's fingerprint fan-out; curation (tagging,
//! rejection) happens in the external catalog layer.

pub mod features;
pub mod matcher;

pub use matcher::{CentroidMatch, FingerprintMatcher, ProfileCatalog};

use uuid::Uuid;

use crate::ipc::events::{Fingerprint, SummaryFeatures};

/// Build the fingerprint for one emitted event.
///
/// `window` is the mono triggering window, `positive_run_ms` the length of
/// the smoother's continuous accept run behind the emission.
pub fn extract(
    event_id: Uuid,
    window: &[f32],
    sample_rate: u32,
    positive_run_ms: u32,
    embedding: Vec<f32>,
    matcher: Option<&FingerprintMatcher>,
) -> Fingerprint {
    let matched = matcher.and_then(|m| m.match_embedding(&embedding));

    Fingerprint {
        fp_id: Uuid::new_v4(),
        event_id,
        summary_features: SummaryFeatures {
            duration_ms: positive_run_ms,
            pitch_hz: features::fundamental_pitch(window, sample_rate),
            spectral_centroid_hz: features::spectral_centroid(window, sample_rate),
        },
        embedding,
        dog_id: matched.as_ref().map(|m| m.dog_id.clone()),
        match_confidence: matched.map(|m| m.confidence),
        rejection_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_without_matcher_has_no_dog() {
        let window: Vec<f32> = (0..16_000)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
            .collect();
        let fp = extract(
            Uuid::new_v4(),
            &window,
            16_000,
            750,
            vec![1.0, 0.0],
            None,
        );
        assert!(fp.dog_id.is_none());
        assert!(fp.match_confidence.is_none());
        assert!(fp.rejection_reason.is_none());
        assert_eq!(fp.summary_features.duration_ms, 750);
        assert!(fp.summary_features.pitch_hz.is_some());
        assert!(fp.summary_features.spectral_centroid_hz > 0.0);
        assert_eq!(fp.embedding, vec![1.0, 0.0]);
    }
}
