//! Deterministic DSP-backed stub models.
//!
//! Used in tests and before real ONNX exports are installed. Instead of a
//! neural network, both stubs look at coarse band energies of the window,
//! so synthetic fixtures behave predictably: an 800 Hz burst reads as
//! dog-like, a 150 Hz hum as speech, a 3 kHz warble as a bird, and a white
//! noise burst as percussive. This exercises the full cascade — gate,
//! coarse threshold, fine veto logic, smoother — end to end.

use rustfft::{num_complex::Complex, FftPlanner};

use crate::error::Result;
use crate::inference::{AudioTagger, AudioTextEncoder};

/// Embedding dimensionality shared by both stub towers.
pub const STUB_EMBEDDING_DIM: usize = 8;

const DIM_BARK: usize = 0;
const DIM_SPEECH: usize = 1;
const DIM_PERCUSSIVE: usize = 2;
const DIM_BIRD: usize = 3;
const DIM_OTHER: usize = 4;
/// Howl labels get their own axis so they never split softmax mass with
/// the bark axis (audio windows have no howl component in this stub).
const DIM_HOWL: usize = 5;

/// Band boundaries in Hz.
const SPEECH_BAND: (f32, f32) = (80.0, 300.0);
const BARK_BAND: (f32, f32) = (300.0, 1_500.0);
const BIRD_BAND: (f32, f32) = (2_500.0, 10_000.0);

/// Per-band energy fractions plus spectral flatness of a window.
#[derive(Debug, Clone, Copy, Default)]
struct BandProfile {
    speech: f32,
    bark: f32,
    bird: f32,
    other: f32,
    flatness: f32,
    rms: f32,
}

fn band_profile(samples: &[f32], sample_rate: u32) -> BandProfile {
    if samples.is_empty() || sample_rate == 0 {
        return BandProfile::default();
    }

    let rms = {
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    };

    let n = samples.len().min(8_192).next_power_of_two().min(8_192);
    let mut buf: Vec<Complex<f32>> = samples
        .iter()
        .take(n)
        .map(|&s| Complex::new(s, 0.0))
        .collect();
    buf.resize(n, Complex::new(0.0, 0.0));

    FftPlanner::<f32>::new().plan_fft_forward(n).process(&mut buf);

    let bin_hz = sample_rate as f32 / n as f32;
    let mut speech = 0f32;
    let mut bark = 0f32;
    let mut bird = 0f32;
    let mut other = 0f32;
    let mut log_sum = 0f64;
    let mut lin_sum = 0f64;
    let bins = n / 2;

    for (k, c) in buf.iter().take(bins).enumerate().skip(1) {
        let freq = k as f32 * bin_hz;
        let power = c.norm_sqr();
        if freq >= SPEECH_BAND.0 && freq < SPEECH_BAND.1 {
            speech += power;
        } else if freq >= BARK_BAND.0 && freq < BARK_BAND.1 {
            bark += power;
        } else if freq >= BIRD_BAND.0 && freq < BIRD_BAND.1 {
            bird += power;
        } else {
            other += power;
        }
        let p = f64::from(power).max(1e-12);
        log_sum += p.ln();
        lin_sum += p;
    }

    let total = speech + bark + bird + other;
    if total <= f32::EPSILON {
        return BandProfile {
            rms,
            ..BandProfile::default()
        };
    }

    let geometric = (log_sum / bins as f64).exp();
    let arithmetic = lin_sum / bins as f64;
    let flatness = if arithmetic > 0.0 {
        (geometric / arithmetic) as f32
    } else {
        0.0
    };

    BandProfile {
        speech: speech / total,
        bark: bark / total,
        bird: bird / total,
        other: other / total,
        flatness: flatness.clamp(0.0, 1.0),
        rms,
    }
}

// ---------------------------------------------------------------------------
// StubTagger
// ---------------------------------------------------------------------------

/// Band-energy stand-in for a multi-label AudioSet tagger.
pub struct StubTagger {
    labels: Vec<String>,
}

/// Class indices of the stub tagger's label set.
pub mod stub_classes {
    pub const ANIMAL: usize = 0;
    pub const DOG: usize = 1;
    pub const BARK: usize = 2;
    pub const SPEECH: usize = 3;
    pub const BIRD: usize = 4;
}

impl StubTagger {
    pub fn new() -> Self {
        Self {
            labels: ["Animal", "Dog", "Bark", "Speech", "Bird vocalization"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl Default for StubTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioTagger for StubTagger {
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    fn probabilities(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let profile = band_profile(samples, sample_rate);
        let loud = (profile.rms * 12.0).clamp(0.0, 1.0);

        let p_dog = (profile.bark * loud).clamp(0.0, 1.0);
        let p_speech = (profile.speech * loud).clamp(0.0, 1.0);
        let p_bird = (profile.bird * loud).clamp(0.0, 1.0);

        let mut probs = vec![0f32; self.labels.len()];
        probs[stub_classes::ANIMAL] = (0.5 * p_dog + 0.5 * p_bird).clamp(0.0, 1.0);
        probs[stub_classes::DOG] = p_dog;
        probs[stub_classes::BARK] = p_dog;
        probs[stub_classes::SPEECH] = p_speech;
        probs[stub_classes::BIRD] = p_bird;
        Ok(probs)
    }

    fn class_labels(&self) -> &[String] {
        &self.labels
    }
}

// ---------------------------------------------------------------------------
// StubEncoder
// ---------------------------------------------------------------------------

/// Band-energy stand-in for a zero-shot audio-text encoder.
///
/// Text labels map onto fixed axes by keyword; audio windows project onto
/// the same axes by band energy. Cosine similarity between the two behaves
/// the way a real CLAP-style model does for clearly separated fixtures.
pub struct StubEncoder;

impl StubEncoder {
    pub fn new() -> Self {
        Self
    }

    fn text_axis(label: &str) -> usize {
        let lowered = label.to_ascii_lowercase();
        const SPEECH_WORDS: &[&str] = &["talk", "speech", "speak", "shout", "person", "voice"];
        const PERCUSSIVE_WORDS: &[&str] = &["clap", "knock", "slam", "thud", "percussive"];
        const BIRD_WORDS: &[&str] = &["bird", "chirp", "tweet"];
        const BARK_WORDS: &[&str] = &["bark", "woof", "dog"];

        if lowered.contains("howl") {
            DIM_HOWL
        } else if BARK_WORDS.iter().any(|w| lowered.contains(w)) {
            DIM_BARK
        } else if SPEECH_WORDS.iter().any(|w| lowered.contains(w)) {
            DIM_SPEECH
        } else if PERCUSSIVE_WORDS.iter().any(|w| lowered.contains(w)) {
            DIM_PERCUSSIVE
        } else if BIRD_WORDS.iter().any(|w| lowered.contains(w)) {
            DIM_BIRD
        } else {
            DIM_OTHER
        }
    }
}

impl Default for StubEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioTextEncoder for StubEncoder {
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    fn embed_text(&mut self, label: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0f32; STUB_EMBEDDING_DIM];
        embedding[Self::text_axis(label)] = 1.0;
        Ok(embedding)
    }

    fn embed_audio(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let profile = band_profile(samples, sample_rate);
        let mut embedding = vec![0f32; STUB_EMBEDDING_DIM];

        // A flat spectrum is percussive regardless of which band dominates.
        let tonal = 1.0 - profile.flatness;
        embedding[DIM_BARK] = profile.bark * tonal;
        embedding[DIM_SPEECH] = profile.speech * tonal;
        embedding[DIM_PERCUSSIVE] = profile.flatness;
        embedding[DIM_BIRD] = profile.bird * tonal;
        embedding[DIM_OTHER] = profile.other * tonal;

        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut embedding {
                *v /= norm;
            }
        }
        Ok(embedding)
    }

    fn embedding_dim(&self) -> usize {
        STUB_EMBEDDING_DIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, sample_rate: u32, seconds: f32, amplitude: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin()
            })
            .collect()
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
        if na <= f32::EPSILON || nb <= f32::EPSILON {
            0.0
        } else {
            dot / (na * nb)
        }
    }

    #[test]
    fn tagger_rates_bark_band_as_dog() {
        let mut tagger = StubTagger::new();
        let bark = tone(800.0, 16_000, 1.0, 0.5);
        let probs = tagger.probabilities(&bark, 16_000).unwrap();
        assert!(probs[stub_classes::DOG] > 0.5, "dog={}", probs[stub_classes::DOG]);
        assert!(probs[stub_classes::DOG] > probs[stub_classes::SPEECH]);
    }

    #[test]
    fn tagger_rates_low_band_as_speech() {
        let mut tagger = StubTagger::new();
        let speech = tone(150.0, 16_000, 1.0, 0.5);
        let probs = tagger.probabilities(&speech, 16_000).unwrap();
        assert!(probs[stub_classes::SPEECH] > probs[stub_classes::DOG]);
    }

    #[test]
    fn tagger_silence_scores_zero() {
        let mut tagger = StubTagger::new();
        let probs = tagger.probabilities(&vec![0.0; 16_000], 16_000).unwrap();
        assert!(probs.iter().all(|&p| p < 1e-3));
    }

    #[test]
    fn encoder_aligns_bark_audio_with_bark_label() {
        let mut encoder = StubEncoder::new();
        let bark_label = encoder.embed_text("dog barking").unwrap();
        let talk_label = encoder.embed_text("person talking").unwrap();
        let audio = encoder
            .embed_audio(&tone(800.0, 16_000, 1.0, 0.5), 16_000)
            .unwrap();
        assert!(cosine(&audio, &bark_label) > cosine(&audio, &talk_label));
    }

    #[test]
    fn encoder_aligns_low_audio_with_speech_label() {
        let mut encoder = StubEncoder::new();
        let bark_label = encoder.embed_text("dog barking").unwrap();
        let talk_label = encoder.embed_text("person talking").unwrap();
        let audio = encoder
            .embed_audio(&tone(150.0, 16_000, 1.0, 0.5), 16_000)
            .unwrap();
        assert!(cosine(&audio, &talk_label) > cosine(&audio, &bark_label));
    }

    #[test]
    fn encoder_axes_are_orthogonal() {
        let mut encoder = StubEncoder::new();
        let a = encoder.embed_text("dog barking").unwrap();
        let b = encoder.embed_text("bird chirping").unwrap();
        assert!(cosine(&a, &b).abs() < 1e-6);
    }
}
