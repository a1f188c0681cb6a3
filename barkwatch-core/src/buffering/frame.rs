//! Typed audio frame produced by the capture worker.

use std::time::Instant;

use chrono::{DateTime, Utc};

/// One device chunk of interleaved PCM, timestamped at capture time.
///
/// Exactly one producer (the capture worker) creates frames; `seq` is
/// strictly increasing and gap-free per stream. Everything downstream holds
/// `Arc<AudioFrame>` snapshots and never mutates a frame after creation.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved f32 samples in [-1.0, 1.0], `channels` samples per tick.
    pub samples: Vec<f32>,
    /// Channel count of the interleaved data.
    pub channels: u16,
    /// Sample rate in Hz (e.g. 44100, 48000).
    pub sample_rate: u32,
    /// Strictly increasing frame counter, assigned by the capture worker.
    pub seq: u64,
    /// Monotonic capture timestamp of the first sample in this frame.
    pub t_monotonic: Instant,
    /// Wall-clock capture timestamp of the first sample in this frame.
    pub t_wall: DateTime<Utc>,
}

impl AudioFrame {
    /// Number of per-channel sample ticks in this frame.
    pub fn len_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.len_per_channel() as f64 / self.sample_rate as f64
    }

    /// Monotonic timestamp just past the last sample of this frame.
    pub fn end_monotonic(&self) -> Instant {
        self.t_monotonic + std::time::Duration::from_secs_f64(self.duration_secs())
    }
}

/// Average interleaved channels down to a mono signal.
///
/// A frame with a single channel is copied through unchanged.
pub fn downmix_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if ch == 1 {
        return interleaved.to_vec();
    }
    let ticks = interleaved.len() / ch;
    let mut mono = Vec::with_capacity(ticks);
    for t in 0..ticks {
        let base = t * ch;
        let mut sum = 0f32;
        for c in 0..ch {
            sum += interleaved[base + c];
        }
        mono.push(sum / ch as f32);
    }
    mono
}

/// Extract one channel from interleaved data.
pub fn extract_channel(interleaved: &[f32], channels: u16, channel: usize) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    if channel >= ch {
        return Vec::new();
    }
    interleaved
        .iter()
        .skip(channel)
        .step_by(ch)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channels() {
        let interleaved = [1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        let mono = downmix_mono(&interleaved, 2);
        assert_eq!(mono, vec![0.5, 0.5, 0.0]);
    }

    #[test]
    fn downmix_mono_passthrough() {
        let samples = [0.1, 0.2, 0.3];
        assert_eq!(downmix_mono(&samples, 1), samples.to_vec());
    }

    #[test]
    fn extract_channel_deinterleaves() {
        let interleaved = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        assert_eq!(extract_channel(&interleaved, 2, 0), vec![1.0, 2.0, 3.0]);
        assert_eq!(extract_channel(&interleaved, 2, 1), vec![10.0, 20.0, 30.0]);
        assert!(extract_channel(&interleaved, 2, 2).is_empty());
    }

    #[test]
    fn frame_duration() {
        let frame = AudioFrame {
            samples: vec![0.0; 882],
            channels: 2,
            sample_rate: 44_100,
            seq: 0,
            t_monotonic: Instant::now(),
            t_wall: Utc::now(),
        };
        assert_eq!(frame.len_per_channel(), 441);
        assert!((frame.duration_secs() - 0.01).abs() < 1e-9);
    }
}
