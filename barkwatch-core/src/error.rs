use thiserror::Error;

/// All errors produced by barkwatch-core.
#[derive(Debug, Error)]
pub enum BarkError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("configuration validation failed: {message}")]
    ConfigValidation { message: String },

    #[error("model load failure in {stage} stage: {message}")]
    ModelLoad {
        stage: &'static str,
        message: String,
    },

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("inference error: {0}")]
    Inference(String),

    #[error(
        "ring buffer snapshot too short: wanted {wanted_samples} samples, had {available_samples}"
    )]
    RingUnderrun {
        wanted_samples: usize,
        available_samples: usize,
    },

    #[error("evidence I/O failure for '{path}'")]
    EvidenceIo {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WAV encode error: {0}")]
    Wav(#[from] hound::Error),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BarkError>;
