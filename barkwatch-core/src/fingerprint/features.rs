//! Scalar acoustic features for event fingerprints.
//!
//! Pitch comes from a normalized autocorrelation over the 60–1000 Hz lag
//! range; windows whose best lag correlates weakly are treated as unvoiced
//! and report no pitch. Spectral centroid is the magnitude-weighted mean
//! frequency of the window's spectrum.

use rustfft::{num_complex::Complex, FftPlanner};

/// Pitch search range, Hz.
const PITCH_MIN_HZ: f32 = 60.0;
const PITCH_MAX_HZ: f32 = 1_000.0;
/// Minimum normalized autocorrelation for a voiced verdict.
const VOICING_THRESHOLD: f32 = 0.4;

/// Fundamental pitch of a mono window, if voiced.
pub fn fundamental_pitch(samples: &[f32], sample_rate: u32) -> Option<f32> {
    if sample_rate == 0 || samples.len() < 64 {
        return None;
    }

    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let centered: Vec<f32> = samples.iter().map(|&s| s - mean).collect();

    let energy: f32 = centered.iter().map(|s| s * s).sum();
    if energy <= f32::EPSILON {
        return None;
    }

    let lag_min = (sample_rate as f32 / PITCH_MAX_HZ).floor().max(1.0) as usize;
    let lag_max = ((sample_rate as f32 / PITCH_MIN_HZ).ceil() as usize).min(centered.len() / 2);
    if lag_min >= lag_max {
        return None;
    }

    let mut best_lag = 0usize;
    let mut best_corr = 0f32;
    for lag in lag_min..=lag_max {
        let mut corr = 0f32;
        for i in 0..centered.len() - lag {
            corr += centered[i] * centered[i + lag];
        }
        let normalized = corr / energy;
        if normalized > best_corr {
            best_corr = normalized;
            best_lag = lag;
        }
    }

    if best_corr < VOICING_THRESHOLD || best_lag == 0 {
        return None;
    }
    Some(sample_rate as f32 / best_lag as f32)
}

/// Magnitude-weighted mean frequency of a mono window, in Hz.
pub fn spectral_centroid(samples: &[f32], sample_rate: u32) -> f32 {
    if samples.is_empty() || sample_rate == 0 {
        return 0.0;
    }

    let n = samples.len().min(16_384).next_power_of_two().min(16_384);
    let mut buf: Vec<Complex<f32>> = samples
        .iter()
        .take(n)
        .map(|&s| Complex::new(s, 0.0))
        .collect();
    buf.resize(n, Complex::new(0.0, 0.0));
    FftPlanner::<f32>::new().plan_fft_forward(n).process(&mut buf);

    let bin_hz = sample_rate as f32 / n as f32;
    let mut weighted = 0f32;
    let mut total = 0f32;
    for (k, c) in buf.iter().take(n / 2).enumerate().skip(1) {
        let magnitude = c.norm();
        weighted += k as f32 * bin_hz * magnitude;
        total += magnitude;
    }

    if total <= f32::EPSILON {
        0.0
    } else {
        weighted / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(freq: f32, sample_rate: u32, seconds: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn pitch_of_a_pure_tone() {
        let samples = tone(220.0, 16_000, 0.5);
        let pitch = fundamental_pitch(&samples, 16_000).expect("voiced");
        assert_relative_eq!(pitch, 220.0, max_relative = 0.05);
    }

    #[test]
    fn pitch_of_a_higher_tone() {
        let samples = tone(440.0, 16_000, 0.5);
        let pitch = fundamental_pitch(&samples, 16_000).expect("voiced");
        assert_relative_eq!(pitch, 440.0, max_relative = 0.05);
    }

    #[test]
    fn silence_is_unvoiced() {
        assert!(fundamental_pitch(&vec![0.0; 8_000], 16_000).is_none());
    }

    #[test]
    fn noise_is_unvoiced() {
        // Deterministic pseudo-noise via a chaotic map.
        let mut x = 0.37f32;
        let noise: Vec<f32> = (0..8_000)
            .map(|_| {
                x = (3.99 * x * (1.0 - x)).fract();
                x - 0.5
            })
            .collect();
        assert!(fundamental_pitch(&noise, 16_000).is_none());
    }

    #[test]
    fn centroid_sits_on_the_tone() {
        let samples = tone(1_000.0, 16_000, 0.5);
        let centroid = spectral_centroid(&samples, 16_000);
        assert_relative_eq!(centroid, 1_000.0, max_relative = 0.1);
    }

    #[test]
    fn centroid_of_silence_is_zero() {
        assert_eq!(spectral_centroid(&vec![0.0; 4_096], 16_000), 0.0);
    }
}
