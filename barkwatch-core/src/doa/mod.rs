//! Direction-of-arrival estimation for a uniform linear array.
//!
//! The event window is split into Hann-windowed FFT segments; a narrowband
//! covariance matrix is accumulated at the dominant bin and scanned over
//! the configured bearing range with three spectral estimators:
//!
//! - **Bartlett** (conventional beamformer) — `P(θ) = aᴴRa`. Robust
//!   baseline, canonical for the UI.
//! - **Capon / MVDR** — `P(θ) = 1 / aᴴR⁻¹a`. Higher resolution, more
//!   sensitive to calibration; the covariance is diagonally loaded before
//!   inversion.
//! - **Maximum entropy** — `P(θ) = 1 / |aᴴ R⁻¹e₀|²`. Sharpest peaks for
//!   close or multiple sources.
//!
//! Geometry: element `m` sits at `m · d` wavelengths along the array axis;
//! a source at bearing θ (degrees from the axis) delays element `m` by
//! `d·m·cos θ` periods, so the steering vector is
//! `a_m(θ) = exp(-j·2π·d·m·cos θ)`. Bearings are scanned at 1° resolution.
//!
//! With fewer than two captured channels no estimate is produced.

use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::buffering::frame::extract_channel;
use crate::config::{DoaConfig, DoaMethod};
use crate::ipc::events::{DirectionBucket, DoaEstimate};

type C32 = Complex<f32>;

/// FFT segment length for covariance snapshots.
const SEGMENT: usize = 512;
/// Band searched for the dominant bin, Hz.
const BAND_MIN_HZ: f32 = 80.0;
const BAND_MAX_HZ: f32 = 8_000.0;
/// Diagonal loading factor relative to mean eigenvalue.
const LOADING: f32 = 1e-3;
/// Windows quieter than this total band power yield no estimate.
const MIN_POWER: f32 = 1e-10;

/// Uniform-linear-array bearing estimator.
pub struct DoaEstimator {
    spacing_wavelengths: f32,
    num_elements: usize,
    angle_min: f32,
    angle_max: f32,
    methods: Vec<DoaMethod>,
}

impl DoaEstimator {
    pub fn new(config: &DoaConfig) -> Self {
        Self {
            spacing_wavelengths: config.element_spacing_wavelengths,
            num_elements: config.num_elements.max(2),
            angle_min: config.angle_min,
            angle_max: config.angle_max,
            methods: config.methods.clone(),
        }
    }

    /// Estimate the bearing of the dominant source in an interleaved
    /// multi-channel window.
    ///
    /// Returns `None` for mono streams, windows shorter than one FFT
    /// segment, or windows with no energy in the search band.
    pub fn estimate(
        &self,
        interleaved: &[f32],
        channels: u16,
        sample_rate: u32,
    ) -> Option<DoaEstimate> {
        if channels < 2 {
            return None;
        }
        let m = self.num_elements.min(channels as usize);

        let per_channel: Vec<Vec<f32>> = (0..m)
            .map(|c| extract_channel(interleaved, channels, c))
            .collect();
        let len = per_channel[0].len();
        if len < SEGMENT {
            return None;
        }

        let covariance = self.covariance(&per_channel, sample_rate)?;
        let inverse = invert(&covariance);

        let mut bartlett = None;
        let mut capon = None;
        let mut mem = None;

        for method in &self.methods {
            let bearing = match method {
                DoaMethod::Bartlett => self.scan(m, |a| {
                    quadratic_form(&covariance, a).re.max(f32::MIN_POSITIVE)
                }),
                DoaMethod::Capon => {
                    let inv = inverse.as_ref()?;
                    self.scan(m, |a| 1.0 / quadratic_form(inv, a).re.max(f32::MIN_POSITIVE))
                }
                DoaMethod::Mem => {
                    let inv = inverse.as_ref()?;
                    let first_col: Vec<C32> = (0..m).map(|r| inv[[r, 0]]).collect();
                    self.scan(m, |a| {
                        let proj: C32 = a
                            .iter()
                            .zip(&first_col)
                            .map(|(ai, ci)| ai.conj() * ci)
                            .sum();
                        1.0 / proj.norm_sqr().max(f32::MIN_POSITIVE)
                    })
                }
            };
            match method {
                DoaMethod::Bartlett => bartlett = Some(bearing),
                DoaMethod::Capon => capon = Some(bearing),
                DoaMethod::Mem => mem = Some(bearing),
            }
        }

        let canonical = match self.methods.first()? {
            DoaMethod::Bartlett => bartlett,
            DoaMethod::Capon => capon,
            DoaMethod::Mem => mem,
        }?;

        Some(DoaEstimate {
            bartlett,
            capon,
            mem,
            direction_bucket: self.bucket(canonical),
        })
    }

    /// Narrowband covariance at the dominant bin, diagonally loaded.
    fn covariance(&self, per_channel: &[Vec<f32>], sample_rate: u32) -> Option<Array2<C32>> {
        let m = per_channel.len();
        let len = per_channel[0].len();
        let segments = len / SEGMENT;

        let hann: Vec<f32> = (0..SEGMENT)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / SEGMENT as f32).cos())
            })
            .collect();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(SEGMENT);

        let spectrum = |channel: &[f32], seg: usize| -> Vec<C32> {
            let start = seg * SEGMENT;
            let mut buf: Vec<C32> = channel[start..start + SEGMENT]
                .iter()
                .zip(&hann)
                .map(|(&s, &w)| Complex::new(s * w, 0.0))
                .collect();
            fft.process(&mut buf);
            buf
        };

        // Pass 1: average power spectrum of the reference channel picks the
        // dominant bin within the search band.
        let bin_hz = sample_rate as f32 / SEGMENT as f32;
        let lo = ((BAND_MIN_HZ / bin_hz).ceil() as usize).max(1);
        let hi = ((BAND_MAX_HZ / bin_hz).floor() as usize).min(SEGMENT / 2 - 1);
        if lo >= hi {
            return None;
        }

        let mut power = vec![0f32; SEGMENT / 2];
        for seg in 0..segments {
            let spec = spectrum(&per_channel[0], seg);
            for (k, p) in power.iter_mut().enumerate().take(SEGMENT / 2) {
                *p += spec[k].norm_sqr();
            }
        }
        let (dominant, peak_power) = (lo..=hi)
            .map(|k| (k, power[k]))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if peak_power / segments as f32 <= MIN_POWER {
            return None;
        }

        // Pass 2: accumulate R = Σ x·xᴴ at the dominant bin.
        let mut r = Array2::<C32>::zeros((m, m));
        for seg in 0..segments {
            let snapshot: Vec<C32> = per_channel
                .iter()
                .map(|ch| spectrum(ch, seg)[dominant])
                .collect();
            for row in 0..m {
                for col in 0..m {
                    r[[row, col]] += snapshot[row] * snapshot[col].conj();
                }
            }
        }
        let scale = 1.0 / segments as f32;
        r.mapv_inplace(|v| v * scale);

        // Diagonal loading keeps the inversion well-conditioned.
        let trace: f32 = (0..m).map(|i| r[[i, i]].re).sum();
        let load = LOADING * trace / m as f32;
        for i in 0..m {
            r[[i, i]] += Complex::new(load, 0.0);
        }

        Some(r)
    }

    /// Scan bearings at 1° steps over an `m`-element steering vector,
    /// returning the spectrum peak.
    fn scan<F: FnMut(&[C32]) -> f32>(&self, m: usize, mut spectrum: F) -> f32 {
        let mut best_theta = self.angle_min;
        let mut best_value = f32::NEG_INFINITY;

        let steps = (self.angle_max - self.angle_min).ceil() as usize;
        for step in 0..=steps {
            let theta = (self.angle_min + step as f32).min(self.angle_max);
            let phase = -2.0
                * std::f32::consts::PI
                * self.spacing_wavelengths
                * theta.to_radians().cos();
            let steering: Vec<C32> = (0..m)
                .map(|e| Complex::from_polar(1.0, phase * e as f32))
                .collect();
            let value = spectrum(&steering);
            if value > best_value {
                best_value = value;
                best_theta = theta;
            }
        }
        best_theta
    }

    /// Quantize a bearing into five equal bins across the scan range,
    /// `angle_min` side first.
    fn bucket(&self, bearing: f32) -> DirectionBucket {
        let span = (self.angle_max - self.angle_min).max(f32::MIN_POSITIVE);
        let idx = (((bearing - self.angle_min) / span) * 5.0).floor() as i32;
        match idx.clamp(0, 4) {
            0 => DirectionBucket::Left,
            1 => DirectionBucket::FrontLeft,
            2 => DirectionBucket::Front,
            3 => DirectionBucket::FrontRight,
            _ => DirectionBucket::Right,
        }
    }
}

/// `aᴴ M a` for a steering vector and a Hermitian matrix.
fn quadratic_form(matrix: &Array2<C32>, a: &[C32]) -> C32 {
    let m = a.len();
    let mut acc = Complex::new(0.0, 0.0);
    for row in 0..m {
        for col in 0..m {
            acc += a[row].conj() * matrix[[row, col]] * a[col];
        }
    }
    acc
}

/// Gauss–Jordan inverse with partial pivoting for small complex matrices.
fn invert(matrix: &Array2<C32>) -> Option<Array2<C32>> {
    let m = matrix.nrows();
    let mut work = matrix.clone();
    let mut inv = Array2::<C32>::eye(m);

    for col in 0..m {
        let pivot_row = (col..m).max_by(|&a, &b| {
            work[[a, col]]
                .norm_sqr()
                .total_cmp(&work[[b, col]].norm_sqr())
        })?;
        if work[[pivot_row, col]].norm_sqr() < 1e-20 {
            return None;
        }
        if pivot_row != col {
            for k in 0..m {
                work.swap([pivot_row, k], [col, k]);
                inv.swap([pivot_row, k], [col, k]);
            }
        }

        let pivot = work[[col, col]];
        for k in 0..m {
            work[[col, k]] /= pivot;
            inv[[col, k]] /= pivot;
        }

        for row in 0..m {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor.norm_sqr() == 0.0 {
                continue;
            }
            for k in 0..m {
                let w = work[[col, k]];
                let i = inv[[col, k]];
                work[[row, k]] -= factor * w;
                inv[[row, k]] -= factor * i;
            }
        }
    }

    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 44_100;

    /// Stereo tone with the inter-channel delay of a source at `bearing`.
    fn stereo_tone(freq: f32, bearing_deg: f32, spacing: f32, seconds: f32) -> Vec<f32> {
        let delay_s = spacing * bearing_deg.to_radians().cos() / freq;
        let n = (SR as f32 * seconds) as usize;
        let mut interleaved = Vec::with_capacity(n * 2);
        for i in 0..n {
            let t = i as f32 / SR as f32;
            interleaved.push(0.5 * (2.0 * std::f32::consts::PI * freq * t).sin());
            interleaved.push(0.5 * (2.0 * std::f32::consts::PI * freq * (t - delay_s)).sin());
        }
        interleaved
    }

    fn estimator() -> DoaEstimator {
        DoaEstimator::new(&DoaConfig::default())
    }

    #[test]
    fn mono_stream_yields_no_estimate() {
        let est = estimator();
        assert!(est.estimate(&vec![0.5; 44_100], 1, SR).is_none());
    }

    #[test]
    fn short_window_yields_no_estimate() {
        let est = estimator();
        assert!(est.estimate(&vec![0.5; 128], 2, SR).is_none());
    }

    #[test]
    fn silent_window_yields_no_estimate() {
        let est = estimator();
        assert!(est.estimate(&vec![0.0; 88_200], 2, SR).is_none());
    }

    #[test]
    fn bearing_45_degrees_lands_front_left() {
        let est = estimator();
        let audio = stereo_tone(800.0, 45.0, 0.5, 1.0);
        let doa = est.estimate(&audio, 2, SR).expect("estimate");
        let bartlett = doa.bartlett.expect("bartlett bearing");
        assert!(
            (30.0..=60.0).contains(&bartlett),
            "bartlett bearing {bartlett} outside [30, 60]"
        );
        assert_eq!(doa.direction_bucket, DirectionBucket::FrontLeft);
    }

    #[test]
    fn broadside_source_lands_front() {
        let est = estimator();
        let audio = stereo_tone(800.0, 90.0, 0.5, 1.0);
        let doa = est.estimate(&audio, 2, SR).expect("estimate");
        let bartlett = doa.bartlett.expect("bartlett bearing");
        assert!(
            (75.0..=105.0).contains(&bartlett),
            "bartlett bearing {bartlett} not near broadside"
        );
        assert_eq!(doa.direction_bucket, DirectionBucket::Front);
    }

    #[test]
    fn all_three_methods_agree_on_a_clean_tone() {
        let est = estimator();
        let audio = stereo_tone(800.0, 120.0, 0.5, 1.0);
        let doa = est.estimate(&audio, 2, SR).expect("estimate");
        let b = doa.bartlett.unwrap();
        let c = doa.capon.unwrap();
        let m = doa.mem.unwrap();
        assert!((b - c).abs() <= 15.0, "bartlett {b} vs capon {c}");
        assert!((b - m).abs() <= 15.0, "bartlett {b} vs mem {m}");
    }

    #[test]
    fn bucket_boundaries() {
        let est = estimator();
        assert_eq!(est.bucket(0.0), DirectionBucket::Left);
        assert_eq!(est.bucket(45.0), DirectionBucket::FrontLeft);
        assert_eq!(est.bucket(90.0), DirectionBucket::Front);
        assert_eq!(est.bucket(130.0), DirectionBucket::FrontRight);
        assert_eq!(est.bucket(180.0), DirectionBucket::Right);
    }

    #[test]
    fn invert_recovers_identity() {
        let mut m = Array2::<C32>::zeros((2, 2));
        m[[0, 0]] = Complex::new(2.0, 0.0);
        m[[0, 1]] = Complex::new(0.0, 1.0);
        m[[1, 0]] = Complex::new(0.0, -1.0);
        m[[1, 1]] = Complex::new(3.0, 0.0);
        let inv = invert(&m).expect("invertible");
        let product = m.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (product[[i, j]].re - expected).abs() < 1e-4
                        && product[[i, j]].im.abs() < 1e-4,
                    "product[{i},{j}] = {:?}",
                    product[[i, j]]
                );
            }
        }
    }
}
