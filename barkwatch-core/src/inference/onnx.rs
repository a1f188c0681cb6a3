//! ONNX backends for the two classifier stages, via the `ort` crate.
//!
//! ## Coarse tagger export
//!
//! | Name       | Shape      | DType | Direction |
//! |------------|------------|-------|-----------|
//! | `waveform` | `[1, N]`   | f32   | in        |
//! | `scores`   | `[1, C]`   | f32   | out       |
//!
//! `waveform` is mono at 16 kHz; `scores` are per-class probabilities in
//! [0, 1] (sigmoid applied inside the graph, AudioSet-style). The class
//! list ships as a sibling text file, one label per line. Input/output
//! names are read from the session at load time, so differently named
//! exports still work.
//!
//! ## Zero-shot encoder export (CLAP-style, two towers)
//!
//! Audio tower `audio_model.onnx`:
//!
//! | Name             | Shape          | DType | Direction |
//! |------------------|----------------|-------|-----------|
//! | `input_features` | `[1, 64, T]`   | f32   | in        |
//! | `audio_embed`    | `[1, D]`       | f32   | out       |
//!
//! Text tower `text_model.onnx` + `tokenizer.json`:
//!
//! | Name             | Shape     | DType | Direction |
//! |------------------|-----------|-------|-----------|
//! | `input_ids`      | `[1, L]`  | i64   | in        |
//! | `attention_mask` | `[1, L]`  | i64   | in        |
//! | `text_embed`     | `[1, D]`  | f32   | out       |
//!
//! The audio front-end is a log-mel spectrogram at 48 kHz (1024-point
//! Hann STFT, hop 480, 64 mel bands, 0–14 kHz), padded/trimmed to a fixed
//! frame count. Both towers' embeddings are L2-normalized here so cosine
//! similarity is a plain dot product downstream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array2, Array3};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Value;
use rustfft::{num_complex::Complex, FftPlanner};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::audio::resample::resample_block;
use crate::error::{BarkError, Result};
use crate::inference::{AudioTagger, AudioTextEncoder};

/// Native sample rate of the coarse tagger export.
const TAGGER_SAMPLE_RATE: u32 = 16_000;
/// The tagger sees at most this many samples (10 s at 16 kHz).
const TAGGER_MAX_SAMPLES: usize = 160_000;

/// Native sample rate of the zero-shot audio tower.
const ENCODER_SAMPLE_RATE: u32 = 48_000;
const MEL_N_FFT: usize = 1_024;
const MEL_HOP: usize = 480;
const MEL_BANDS: usize = 64;
const MEL_FMIN: f32 = 0.0;
const MEL_FMAX: f32 = 14_000.0;
/// Fixed frame count of the audio tower input (~10 s at hop 480).
const MEL_FRAMES: usize = 1_000;

fn create_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(BarkError::ModelNotFound {
            path: model_path.to_path_buf(),
        });
    }

    let intra_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 8);

    SessionBuilder::new()
        .map_err(|e| BarkError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| BarkError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| BarkError::OnnxSession(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| BarkError::OnnxSession(e.to_string()))
}

fn io_names(session: &Session) -> (Vec<String>, Vec<String>) {
    let inputs = session
        .inputs()
        .iter()
        .map(|outlet| outlet.name().to_string())
        .collect();
    let outputs = session
        .outputs()
        .iter()
        .map(|outlet| outlet.name().to_string())
        .collect();
    (inputs, outputs)
}

fn l2_normalize(embedding: &mut [f32]) {
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in embedding.iter_mut() {
            *v /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// OnnxTagger
// ---------------------------------------------------------------------------

/// File locations for the coarse tagger export.
#[derive(Debug, Clone)]
pub struct OnnxTaggerConfig {
    pub model_path: PathBuf,
    /// Class list, one label per line, ordered by class index.
    pub labels_path: PathBuf,
}

/// Multi-label audio tagger backed by an ONNX session.
pub struct OnnxTagger {
    config: OnnxTaggerConfig,
    session: Option<Session>,
    input_name: String,
    output_name: String,
    labels: Vec<String>,
}

impl OnnxTagger {
    pub fn new(config: OnnxTaggerConfig) -> Self {
        Self {
            config,
            session: None,
            input_name: String::new(),
            output_name: String::new(),
            labels: Vec::new(),
        }
    }

    fn run_scores(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(session) = self.session.as_mut() else {
            return Err(BarkError::OnnxSession(
                "tagger not loaded — call warm_up()".into(),
            ));
        };

        let mut trimmed = samples.to_vec();
        trimmed.truncate(TAGGER_MAX_SAMPLES);
        let len = trimmed.len();
        let input = Array2::from_shape_vec((1, len), trimmed)
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        let value =
            Value::from_array(input).map_err(|e: ort::Error| BarkError::OnnxSession(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => value])
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        let (_, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;

        Ok(data.to_vec())
    }
}

impl AudioTagger for OnnxTagger {
    fn warm_up(&mut self) -> Result<()> {
        info!(model = ?self.config.model_path, "loading coarse tagger");
        let session = create_session(&self.config.model_path)?;
        let (inputs, outputs) = io_names(&session);
        self.input_name = inputs.first().cloned().unwrap_or_else(|| "waveform".into());
        self.output_name = outputs.first().cloned().unwrap_or_else(|| "scores".into());

        let raw = std::fs::read_to_string(&self.config.labels_path).map_err(|e| {
            BarkError::ModelLoad {
                stage: "coarse",
                message: format!(
                    "labels file {:?} unreadable: {e}",
                    self.config.labels_path
                ),
            }
        })?;
        self.labels = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if self.labels.is_empty() {
            return Err(BarkError::ModelLoad {
                stage: "coarse",
                message: format!("labels file {:?} is empty", self.config.labels_path),
            });
        }

        self.session = Some(session);

        // Dummy forward pass to populate caches and fail fast on shape
        // mismatches.
        let scores = self.run_scores(&vec![0.0f32; TAGGER_SAMPLE_RATE as usize])?;
        if scores.len() != self.labels.len() {
            warn!(
                scores = scores.len(),
                labels = self.labels.len(),
                "tagger output count does not match labels file"
            );
        }
        info!(classes = self.labels.len(), "coarse tagger ready");
        Ok(())
    }

    fn probabilities(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let resampled = resample_block(samples, sample_rate, TAGGER_SAMPLE_RATE)?;
        self.run_scores(&resampled)
    }

    fn class_labels(&self) -> &[String] {
        &self.labels
    }
}

// ---------------------------------------------------------------------------
// OnnxAudioTextEncoder
// ---------------------------------------------------------------------------

/// File locations for the zero-shot encoder export.
#[derive(Debug, Clone)]
pub struct OnnxEncoderConfig {
    pub audio_model_path: PathBuf,
    pub text_model_path: PathBuf,
    pub tokenizer_path: PathBuf,
}

impl OnnxEncoderConfig {
    /// Conventional layout: one directory holding all three files.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            audio_model_path: dir.join("audio_model.onnx"),
            text_model_path: dir.join("text_model.onnx"),
            tokenizer_path: dir.join("tokenizer.json"),
        }
    }
}

/// Zero-shot audio/text embedding model backed by two ONNX sessions.
pub struct OnnxAudioTextEncoder {
    config: OnnxEncoderConfig,
    audio_session: Option<Session>,
    text_session: Option<Session>,
    tokenizer: Option<Tokenizer>,
    audio_input_name: String,
    audio_output_name: String,
    text_output_name: String,
    dim: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: Arc<dyn rustfft::Fft<f32>>,
}

impl OnnxAudioTextEncoder {
    pub fn new(config: OnnxEncoderConfig) -> Self {
        let hann_window = build_hann_window(MEL_N_FFT);
        let mel_filters =
            build_mel_filters(MEL_N_FFT, ENCODER_SAMPLE_RATE, MEL_BANDS, MEL_FMIN, MEL_FMAX);
        let fft = Arc::from(FftPlanner::<f32>::new().plan_fft_forward(MEL_N_FFT));

        Self {
            config,
            audio_session: None,
            text_session: None,
            tokenizer: None,
            audio_input_name: String::new(),
            audio_output_name: String::new(),
            text_output_name: String::new(),
            dim: 0,
            mel_filters,
            hann_window,
            fft,
        }
    }

    fn log_mel(&self, samples: &[f32]) -> Array3<f32> {
        let mut mel = Array3::<f32>::zeros((1, MEL_BANDS, MEL_FRAMES));
        let n_freqs = MEL_N_FFT / 2 + 1;
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); MEL_N_FFT];

        let active_frames = (samples.len() / MEL_HOP + 1).min(MEL_FRAMES);
        for frame in 0..active_frames {
            let start = frame * MEL_HOP;

            for v in fft_buf.iter_mut() {
                *v = Complex::new(0.0, 0.0);
            }
            for i in 0..MEL_N_FFT {
                let Some(&s) = samples.get(start + i) else {
                    break;
                };
                fft_buf[i] = Complex::new(s * self.hann_window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);

            for m in 0..MEL_BANDS {
                let mut energy = 0.0f32;
                for k in 0..n_freqs {
                    energy += self.mel_filters[m][k] * fft_buf[k].norm_sqr();
                }
                mel[[0, m, frame]] = energy;
            }
        }

        mel.mapv_inplace(|v| v.max(1e-10).log10());
        mel
    }

    fn extract_embedding(outputs: &ort::session::SessionOutputs<'_>, output_name: &str) -> Result<Vec<f32>> {
        let (_, data) = outputs[output_name]
            .try_extract_tensor::<f32>()
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        let mut embedding = data.to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

impl AudioTextEncoder for OnnxAudioTextEncoder {
    fn warm_up(&mut self) -> Result<()> {
        info!(audio = ?self.config.audio_model_path, text = ?self.config.text_model_path, "loading zero-shot encoder");

        let audio_session = create_session(&self.config.audio_model_path)?;
        let (audio_inputs, audio_outputs) = io_names(&audio_session);
        self.audio_input_name = audio_inputs
            .first()
            .cloned()
            .unwrap_or_else(|| "input_features".into());
        self.audio_output_name = audio_outputs
            .first()
            .cloned()
            .unwrap_or_else(|| "audio_embed".into());
        self.audio_session = Some(audio_session);

        let text_session = create_session(&self.config.text_model_path)?;
        let (_, text_outputs) = io_names(&text_session);
        self.text_output_name = text_outputs
            .first()
            .cloned()
            .unwrap_or_else(|| "text_embed".into());
        self.text_session = Some(text_session);

        self.tokenizer = Some(
            Tokenizer::from_file(&self.config.tokenizer_path)
                .map_err(|e| BarkError::OnnxSession(e.to_string()))?,
        );

        // Dummy audio forward pass pins the embedding dimensionality.
        let dummy = self.embed_audio(&vec![0.0f32; ENCODER_SAMPLE_RATE as usize], ENCODER_SAMPLE_RATE)?;
        self.dim = dummy.len();
        info!(dim = self.dim, "zero-shot encoder ready");
        Ok(())
    }

    fn embed_text(&mut self, label: &str) -> Result<Vec<f32>> {
        let Some(tokenizer) = self.tokenizer.as_ref() else {
            return Err(BarkError::OnnxSession(
                "encoder not loaded — call warm_up()".into(),
            ));
        };
        let encoding = tokenizer
            .encode(label, true)
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| i64::from(m))
            .collect();
        let len = ids.len();

        let ids_arr = Array2::from_shape_vec((1, len), ids)
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        let mask_arr = Array2::from_shape_vec((1, len), mask)
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        let ids_val = Value::from_array(ids_arr)
            .map_err(|e: ort::Error| BarkError::OnnxSession(e.to_string()))?;
        let mask_val = Value::from_array(mask_arr)
            .map_err(|e: ort::Error| BarkError::OnnxSession(e.to_string()))?;

        let Some(session) = self.text_session.as_mut() else {
            return Err(BarkError::OnnxSession(
                "encoder not loaded — call warm_up()".into(),
            ));
        };
        let outputs = session
            .run(ort::inputs![
                "input_ids"      => ids_val,
                "attention_mask" => mask_val,
            ])
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        Self::extract_embedding(&outputs, &self.text_output_name)
    }

    fn embed_audio(&mut self, samples: &[f32], sample_rate: u32) -> Result<Vec<f32>> {
        let resampled = resample_block(samples, sample_rate, ENCODER_SAMPLE_RATE)?;
        let mel = self.log_mel(&resampled);
        let mel_val = Value::from_array(mel)
            .map_err(|e: ort::Error| BarkError::OnnxSession(e.to_string()))?;

        let Some(session) = self.audio_session.as_mut() else {
            return Err(BarkError::OnnxSession(
                "encoder not loaded — call warm_up()".into(),
            ));
        };
        let outputs = session
            .run(ort::inputs![self.audio_input_name.as_str() => mel_val])
            .map_err(|e| BarkError::OnnxSession(e.to_string()))?;
        Self::extract_embedding(&outputs, &self.audio_output_name)
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Mel helpers
// ---------------------------------------------------------------------------

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(
    fft_size: usize,
    sr: u32,
    n_mels: usize,
    fmin: f32,
    fmax: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);

    let mel_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .collect();

    let hz_pts: Vec<f32> = mel_pts.iter().map(|&m| mel_to_hz(m)).collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for m in 0..n_mels {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filters[m][k] = w.max(0.0);
        }
    }
    filters
}

fn hz_to_mel(hz: f32) -> f32 {
    2_595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2_595.0) - 1.0)
}
