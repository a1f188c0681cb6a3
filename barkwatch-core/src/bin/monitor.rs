//! Development monitor: run the engine against the default input device
//! and log everything it emits.
//!
//! ```text
//! cargo run -p barkwatch-core --bin monitor -- [--device <name>] [--stub]
//! ```
//!
//! `--stub` uses the deterministic DSP stub backends instead of ONNX
//! exports, which is enough to watch the cascade and evidence recorder
//! work end to end.

use std::sync::Arc;

use barkwatch_core::inference::stub::{StubEncoder, StubTagger};
use barkwatch_core::{BarkEngine, Config, EncoderHandle, TaggerHandle};

#[derive(Debug, Default)]
struct Args {
    device: Option<String>,
    stub: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--device" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --device".into());
                };
                args.device = Some(v);
            }
            "--stub" => args.stub = true,
            "--help" | "-h" => {
                println!("Usage: monitor [--device <name>] [--stub]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("monitor: {e}");
            std::process::exit(2);
        }
    };

    let mut config = Config::default();
    config.audio.device_name = args.device;

    let (tagger, encoder) = if args.stub {
        (
            Some(TaggerHandle::new(StubTagger::new())),
            Some(EncoderHandle::new(StubEncoder::new())),
        )
    } else {
        #[cfg(feature = "onnx")]
        {
            use barkwatch_core::{OnnxAudioTextEncoder, OnnxEncoderConfig, OnnxTagger,
                OnnxTaggerConfig};
            let models = std::path::PathBuf::from(
                std::env::var("BARKWATCH_MODEL_DIR").unwrap_or_else(|_| "models".into()),
            );
            (
                Some(TaggerHandle::new(OnnxTagger::new(OnnxTaggerConfig {
                    model_path: models.join("tagger.onnx"),
                    labels_path: models.join("tagger_labels.txt"),
                }))),
                Some(EncoderHandle::new(OnnxAudioTextEncoder::new(
                    OnnxEncoderConfig::from_dir(models.join(&config.fine.model_identifier)),
                ))),
            )
        }
        #[cfg(not(feature = "onnx"))]
        {
            eprintln!("monitor: built without the onnx feature; pass --stub");
            std::process::exit(2)
        }
    };

    let engine = match BarkEngine::new(config, tagger, encoder, None) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("monitor: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.warm_up() {
        eprintln!("monitor: warm-up failed: {e}");
        std::process::exit(1);
    }
    if let Err(e) = engine.start() {
        eprintln!("monitor: start failed: {e}");
        std::process::exit(1);
    }

    let mut events = engine.subscribe_events();
    let mut fingerprints = engine.subscribe_fingerprints();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!(
                "[{}] {} p={:.2} doa={:?}",
                event.t_event, event.top_label, event.probability, event.doa
            );
        }
    });
    let fp_task = tokio::spawn(async move {
        while let Ok(fp) = fingerprints.recv().await {
            println!(
                "  fingerprint {} pitch={:?} centroid={:.0} Hz dog={:?}",
                fp.fp_id,
                fp.summary_features.pitch_hz,
                fp.summary_features.spectral_centroid_hz,
                fp.dog_id
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    println!("stopping…");
    let _ = engine.stop();
    let snap = engine.status_snapshot();
    println!(
        "frames_in={} ticks={} vad_skipped={} coarse_skipped={} fine_runs={} events={} clips={}",
        snap.counters.frames_in,
        snap.counters.ticks,
        snap.counters.vad_skipped,
        snap.counters.coarse_skipped,
        snap.counters.fine_runs,
        snap.counters.events_emitted,
        snap.counters.evidence_written,
    );
    event_task.abort();
    fp_task.abort();
}
