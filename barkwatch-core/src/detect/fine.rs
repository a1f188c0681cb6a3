//! Fine classifier: zero-shot audio-text scoring with veto labels.
//!
//! The configured label set is embedded exactly once at warm-up into a
//! [`LabelBank`]; the hot path embeds audio only. Scores are cosine
//! similarities **softmax-normalized over the full label set** (scaled by a
//! fixed logit factor) — one probability mass makes `p_veto > p_bark`
//! comparisons meaningful across groups, which an independent per-label
//! sigmoid would not.
//!
//! Decision per window:
//! 1. `p_bark` = max over positive labels.
//! 2. Per veto group, `p_group` = max over that group's labels.
//! 3. `top_label` = argmax over all labels.
//! 4. Reject when `top_label` is a veto label, or any group exceeds both
//!    its threshold and `p_bark`.
//! 5. Otherwise tentatively accept when `p_bark ≥ threshold`.

use std::sync::Arc;

use crate::config::FineConfig;
use crate::error::Result;
use crate::inference::EncoderHandle;
use crate::ipc::events::{FineReading, VetoScores};

/// Softmax temperature applied to cosine similarities.
const LOGIT_SCALE: f32 = 20.0;

/// Which decision role a label plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelRole {
    Positive,
    SpeechVeto,
    PercussiveVeto,
    BirdVeto,
}

impl LabelRole {
    pub fn is_veto(self) -> bool {
        self != LabelRole::Positive
    }
}

/// One label with its cached text embedding.
#[derive(Debug, Clone)]
pub struct LabelEntry {
    pub label: String,
    pub role: LabelRole,
    embedding: Vec<f32>,
}

/// Immutable set of label embeddings, computed once at warm-up and shared
/// behind an `Arc`.
#[derive(Debug)]
pub struct LabelBank {
    entries: Vec<LabelEntry>,
}

impl LabelBank {
    /// Embed every configured label through the encoder. The encoder lock
    /// is held per label, not across the whole build.
    pub fn build(config: &FineConfig, encoder: &EncoderHandle) -> Result<Self> {
        let groups = [
            (&config.positive_labels, LabelRole::Positive),
            (&config.speech_veto_labels, LabelRole::SpeechVeto),
            (&config.percussive_veto_labels, LabelRole::PercussiveVeto),
            (&config.bird_veto_labels, LabelRole::BirdVeto),
        ];

        let mut entries = Vec::new();
        for (labels, role) in groups {
            for label in labels.iter() {
                let mut embedding = encoder.0.lock().embed_text(label)?;
                normalize(&mut embedding);
                entries.push(LabelEntry {
                    label: label.clone(),
                    role,
                    embedding,
                });
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of one fine evaluation.
#[derive(Debug, Clone)]
pub struct FineDecision {
    pub reading: FineReading,
    /// L2-normalized audio embedding of the window; reused downstream by
    /// the fingerprint extractor, never recomputed.
    pub embedding: Vec<f32>,
}

/// Zero-shot classifier over a cached label bank.
pub struct FineClassifier {
    encoder: EncoderHandle,
    bank: Arc<LabelBank>,
    threshold: f32,
    veto_speech: f32,
    veto_percussive: f32,
    veto_bird: f32,
}

impl FineClassifier {
    pub fn new(config: &FineConfig, encoder: EncoderHandle, bank: Arc<LabelBank>) -> Self {
        Self {
            encoder,
            bank,
            threshold: config.threshold,
            veto_speech: config.veto_thresholds.speech,
            veto_percussive: config.veto_thresholds.percussive,
            veto_bird: config.veto_thresholds.bird,
        }
    }

    /// Score one mono window against the label bank.
    ///
    /// # Errors
    /// Propagates encoder failures; the caller fails open for the tick and
    /// counts the error.
    pub fn evaluate(&self, samples: &[f32], sample_rate: u32) -> Result<FineDecision> {
        if self.bank.is_empty() {
            return Err(crate::error::BarkError::Inference(
                "label bank is empty".into(),
            ));
        }

        let mut embedding = self.encoder.0.lock().embed_audio(samples, sample_rate)?;
        normalize(&mut embedding);

        // Cosine similarity against every cached label, then softmax.
        let sims: Vec<f32> = self
            .bank
            .entries
            .iter()
            .map(|e| dot(&embedding, &e.embedding))
            .collect();
        let scores = softmax(&sims, LOGIT_SCALE);

        let mut p_bark = 0f32;
        let mut veto = VetoScores::default();
        let mut top_idx = 0usize;
        for (idx, (entry, &score)) in self.bank.entries.iter().zip(&scores).enumerate() {
            if score > scores[top_idx] {
                top_idx = idx;
            }
            match entry.role {
                LabelRole::Positive => p_bark = p_bark.max(score),
                LabelRole::SpeechVeto => veto.speech = veto.speech.max(score),
                LabelRole::PercussiveVeto => veto.percussive = veto.percussive.max(score),
                LabelRole::BirdVeto => veto.bird = veto.bird.max(score),
            }
        }

        let top = &self.bank.entries[top_idx];
        let vetoed = top.role.is_veto()
            || (veto.speech > self.veto_speech && veto.speech > p_bark)
            || (veto.percussive > self.veto_percussive && veto.percussive > p_bark)
            || (veto.bird > self.veto_bird && veto.bird > p_bark);

        let accepted = !vetoed && p_bark >= self.threshold;

        Ok(FineDecision {
            reading: FineReading {
                p_bark,
                top_label: top.label.clone(),
                veto_scores: veto,
                accepted,
                vetoed,
            },
            embedding,
        })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn softmax(sims: &[f32], scale: f32) -> Vec<f32> {
    if sims.is_empty() {
        return Vec::new();
    }
    let max = sims.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = sims.iter().map(|&s| ((s - max) * scale).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}
