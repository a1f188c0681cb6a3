//! Model abstractions for the two classifier stages.
//!
//! Two seams decouple the pipeline from any specific backend:
//!
//! - [`AudioTagger`] — the coarse pre-filter: a multi-label tagger mapping
//!   an audio window to per-class probabilities (e.g. an AudioSet export).
//! - [`AudioTextEncoder`] — the fine zero-shot model: a shared embedding
//!   space for text labels and audio windows (e.g. a CLAP export).
//!
//! `&mut self` on the inference methods intentionally expresses that
//! backends are stateful (sessions, scratch buffers); all mutation is
//! serialised through the handles' `parking_lot::Mutex`.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxAudioTextEncoder, OnnxEncoderConfig, OnnxTagger, OnnxTaggerConfig};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Contract for coarse multi-label audio taggers.
pub trait AudioTagger: Send + 'static {
    /// One-time warm-up: load weights, run a dummy inference.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Per-class probabilities for a mono f32 window.
    ///
    /// Implementations resample internally when `sample_rate` differs from
    /// the model's native rate. The returned vector always has
    /// `class_labels().len()` entries.
    fn probabilities(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>>;

    /// Ordered class label names; index positions match `probabilities`.
    fn class_labels(&self) -> &[String];
}

/// Contract for zero-shot audio/text embedding backends.
pub trait AudioTextEncoder: Send + 'static {
    /// One-time warm-up: load weights, run a dummy inference.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Embed a text label into the shared space.
    fn embed_text(&mut self, label: &str) -> Result<Vec<f32>>;

    /// Embed a mono f32 audio window into the shared space.
    ///
    /// Implementations resample internally when `sample_rate` differs from
    /// the model's native rate.
    fn embed_audio(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>>;

    /// Dimensionality of the embedding space.
    fn embedding_dim(&self) -> usize;
}

/// Thread-safe reference-counted handle to any [`AudioTagger`].
#[derive(Clone)]
pub struct TaggerHandle(pub Arc<Mutex<dyn AudioTagger>>);

impl TaggerHandle {
    pub fn new<T: AudioTagger>(tagger: T) -> Self {
        Self(Arc::new(Mutex::new(tagger)))
    }
}

impl std::fmt::Debug for TaggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggerHandle").finish_non_exhaustive()
    }
}

/// Thread-safe reference-counted handle to any [`AudioTextEncoder`].
#[derive(Clone)]
pub struct EncoderHandle(pub Arc<Mutex<dyn AudioTextEncoder>>);

impl EncoderHandle {
    pub fn new<E: AudioTextEncoder>(encoder: E) -> Self {
        Self(Arc::new(Mutex::new(encoder)))
    }
}

impl std::fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderHandle").finish_non_exhaustive()
    }
}
