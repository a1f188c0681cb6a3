//! Audio buffering: the real-time SPSC sample ring and the shared frame ring.
//!
//! Two layers:
//!
//! 1. `ringbuf::HeapRb<f32>` carries raw interleaved samples from the cpal
//!    callback to the capture worker. `push_slice` is wait-free and
//!    allocation-free, safe on the OS audio thread.
//! 2. [`FrameRing`] holds the last ~30 s of timestamped [`AudioFrame`]s.
//!    The capture worker is its only writer (overwrite-oldest on overflow);
//!    the detector, DoA and evidence stages take `Arc` snapshots and never
//!    hold the lock while processing.

pub mod frame;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use ringbuf::{traits::Split, HeapRb};

pub use frame::AudioFrame;
pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half — held by the audio callback thread.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half — held by the capture worker.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Callback-hop ring capacity: 2^20 interleaved samples ≈ 11.9 s of stereo
/// at 44.1 kHz. The capture worker drains every few milliseconds; anything
/// left over at this depth is an xrun.
pub const SAMPLE_RING_CAPACITY: usize = 1 << 20;

/// Create a matched producer/consumer pair backed by a heap-allocated ring.
pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(SAMPLE_RING_CAPACITY).split()
}

/// Bounded FIFO of captured frames with overwrite-oldest semantics.
///
/// Appends never block on readers and never fail: when the ring is full the
/// oldest frame is dropped. Readers receive cheap `Arc` clones, so a slow
/// consumer can keep a frame alive without stalling the producer.
pub struct FrameRing {
    frames: RwLock<std::collections::VecDeque<Arc<AudioFrame>>>,
    capacity: usize,
}

impl FrameRing {
    /// Create a ring holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: RwLock::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Ring sized for `seconds` of audio in `chunk_samples`-tick frames.
    pub fn with_duration(seconds: f64, sample_rate: u32, chunk_samples: usize) -> Self {
        let chunk_secs = chunk_samples.max(1) as f64 / sample_rate.max(1) as f64;
        Self::new((seconds / chunk_secs).ceil() as usize)
    }

    /// Append a frame, dropping the oldest when full.
    pub fn push(&self, frame: AudioFrame) {
        let mut frames = self.frames.write();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(Arc::new(frame));
    }

    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the newest frame, if any.
    pub fn latest_seq(&self) -> Option<u64> {
        self.frames.read().back().map(|f| f.seq)
    }

    /// Monotonic end timestamp of the newest frame, if any.
    pub fn latest_end(&self) -> Option<Instant> {
        self.frames.read().back().map(|f| f.end_monotonic())
    }

    /// Snapshot of the most recent frames spanning at least `seconds` of
    /// audio, oldest first. Returns fewer frames when the ring holds less.
    pub fn snapshot_seconds(&self, seconds: f64) -> Vec<Arc<AudioFrame>> {
        let frames = self.frames.read();
        let mut acc = 0.0;
        let mut taken = Vec::new();
        for frame in frames.iter().rev() {
            if acc >= seconds {
                break;
            }
            acc += frame.duration_secs();
            taken.push(Arc::clone(frame));
        }
        taken.reverse();
        taken
    }

    /// Snapshot of frames overlapping the monotonic interval `[start, end)`,
    /// oldest first.
    pub fn snapshot_between(&self, start: Instant, end: Instant) -> Vec<Arc<AudioFrame>> {
        let frames = self.frames.read();
        frames
            .iter()
            .filter(|f| f.end_monotonic() > start && f.t_monotonic < end)
            .cloned()
            .collect()
    }
}
