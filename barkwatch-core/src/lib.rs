//! # barkwatch-core
//!
//! Real-time bark detection engine: ring-buffered capture, a multi-stage
//! classification cascade, direction-of-arrival estimation, durable
//! evidence clips and per-dog fingerprinting.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC ring → capture worker → FrameRing
//!                                                             │ snapshots
//!                                       detector worker (tick loop)
//!                            energy gate → coarse tagger → fine zero-shot
//!                                                             │
//!                                                      DecisionSmoother
//!                                                             │ emit
//!                                        DoA ── BarkEvent ── Fingerprint
//!                                                   │
//!                     evidence worker (clip + sidecar + index)  +  fan-out
//! ```
//!
//! The audio callback is zero-alloc; all heap work happens on the capture,
//! detector and evidence workers. The supervisor ([`BarkEngine`]) owns
//! every worker lifecycle and all broadcast channels.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod detect;
pub mod doa;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod inference;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use config::Config;
pub use engine::BarkEngine;
pub use error::BarkError;
pub use fingerprint::{FingerprintMatcher, ProfileCatalog};
pub use inference::{AudioTagger, AudioTextEncoder, EncoderHandle, TaggerHandle};
pub use ipc::events::{
    AudioLevelTick, BarkEvent, EngineStatus, EngineStatusEvent, Fingerprint,
    PipelineStageTelemetry, StatusSnapshot,
};

#[cfg(feature = "onnx")]
pub use inference::{OnnxAudioTextEncoder, OnnxEncoderConfig, OnnxTagger, OnnxTaggerConfig};
