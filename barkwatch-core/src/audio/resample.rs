//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Frames are stored at the capture rate end to end — evidence clips keep
//! the device rate — so nothing in the crate resamples a continuous
//! stream. Conversion happens per analysis window instead: the coarse
//! tagger wants 16 kHz mono and the zero-shot encoder has its own native
//! rate. [`resample_block`] converts one complete window per call and
//! carries no state between calls, so overlapping detector snapshots do
//! not bleed into each other.
//!
//! When input rate == output rate the call is a plain copy.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::error::{BarkError, Result};

/// Resample a complete window in one call.
///
/// The whole block goes through a freshly sized resampler and the
/// interpolation tail is flushed, so the output keeps the window's full
/// duration.
///
/// # Errors
/// Returns `BarkError::AudioDevice` if rubato fails to initialise or run.
pub fn resample_block(samples: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = output_rate as f64 / input_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0, // fixed ratio — no dynamic adjustment
        PolynomialDegree::Cubic,
        samples.len(),
        1, // mono
    )
    .map_err(|e| BarkError::AudioDevice(format!("resampler init: {e}")))?;

    let mut out = resampler
        .process(&[samples], None)
        .map_err(|e| BarkError::AudioDevice(format!("resampler process: {e}")))?;

    let mut result = out.swap_remove(0);

    if let Ok(mut tail) = resampler.process_partial::<&[f32]>(None, None) {
        result.append(&mut tail.swap_remove(0));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_duration_44k_to_16k() {
        let samples = vec![0.25f32; 44_100];
        let out = resample_block(&samples, 44_100, 16_000).unwrap();
        let expected = 16_000usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 64,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn upsamples_16k_to_48k() {
        let samples = vec![0.1f32; 16_000];
        let out = resample_block(&samples, 16_000, 48_000).unwrap();
        let expected = 48_000usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 192,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn equal_rates_pass_through() {
        let samples = vec![0.5f32; 100];
        let out = resample_block(&samples, 16_000, 16_000).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn empty_input_stays_empty() {
        let out = resample_block(&[], 44_100, 16_000).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn successive_windows_are_independent() {
        // Same input twice must give identical output — no state leaks
        // from one window into the next.
        let samples: Vec<f32> = (0..4_410)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44_100.0).sin())
            .collect();
        let first = resample_block(&samples, 44_100, 16_000).unwrap();
        let second = resample_block(&samples, 44_100, 16_000).unwrap();
        assert_eq!(first, second);
    }
}
