//! Evidence file formats: WAV clip + JSON sidecar.
//!
//! Durability contract (invariant-bearing, do not reorder):
//! 1. audio is written to `<basename>.wav.tmp`, fsync'd, renamed;
//! 2. the sidecar is written to `<basename>.json.tmp`, fsync'd, renamed;
//! 3. only then is the index entry appended.
//!
//! A crash mid-write leaves at most an orphan `.tmp` file, never a corrupt
//! indexed record.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::WavSampleFormat;
use crate::error::{BarkError, Result};
use crate::ipc::events::{DoaEstimate, VetoScores};

/// Sidecar schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Detection block of the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionMeta {
    pub probability: f32,
    pub top_label: String,
    pub veto_scores: VetoScores,
}

/// Device block of the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub hostname: String,
    pub microphone_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DeviceMeta {
    pub fn for_device(microphone_name: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            microphone_name: microphone_name.to_string(),
            sample_rate,
            channels,
        }
    }
}

/// One persisted evidence clip's metadata. Written as the JSON sidecar and
/// referenced by the evidence index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub filename: String,
    /// ISO 8601 with `Z` suffix.
    pub timestamp_utc: String,
    pub timestamp_local: String,
    pub duration_seconds: f64,
    pub peak_probability: f32,
    pub bark_count_in_clip: u32,
    pub detection: DetectionMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doa: Option<DoaEstimate>,
    pub device: DeviceMeta,
    /// True when shutdown cut the clip short of its future context.
    pub truncated: bool,
    pub schema_version: u32,
}

impl EvidenceRecord {
    /// Calendar date (UTC) this record belongs to, for index queries.
    pub fn date_utc(&self) -> Option<chrono::NaiveDate> {
        DateTime::parse_from_rfc3339(&self.timestamp_utc)
            .ok()
            .map(|t| t.with_timezone(&Utc).date_naive())
    }
}

/// `YYYY-MM-DDTHH-MM-SS_<shortid>` — the shared basename of the clip pair.
///
/// The timestamp is the event's local time; the short id disambiguates two
/// events within the same second.
pub fn clip_basename(t_event: DateTime<Utc>, event_id: Uuid) -> String {
    let local = t_event.with_timezone(&Local);
    let short = &event_id.simple().to_string()[..8];
    format!("{}_{short}", local.format("%Y-%m-%dT%H-%M-%S"))
}

/// RFC 3339 timestamps for the sidecar, UTC (`Z`) and local.
pub fn sidecar_timestamps(t_event: DateTime<Utc>) -> (String, String) {
    (
        t_event.to_rfc3339_opts(SecondsFormat::Millis, true),
        t_event
            .with_timezone(&Local)
            .to_rfc3339_opts(SecondsFormat::Millis, false),
    )
}

fn io_err(path: &Path, source: std::io::Error) -> BarkError {
    BarkError::EvidenceIo {
        path: path.to_path_buf(),
        source,
    }
}

/// Durably replace `path` with `bytes` via a sibling temp file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(
        path.extension()
            .map(|e| format!("{}.tmp", e.to_string_lossy()))
            .unwrap_or_else(|| "tmp".to_string()),
    );

    {
        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(bytes).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    sync_parent_dir(path);
    Ok(())
}

fn sync_parent_dir(path: &Path) {
    // Directory fsync is best-effort: not all platforms support it.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// Write the stitched clip as WAV, temp-file + fsync + rename.
///
/// Little-endian PCM16 or IEEE float32 per configuration; sample rate and
/// channel count as captured; no metadata chunks beyond the standard
/// header.
pub fn write_wav(
    path: &Path,
    interleaved: &[f32],
    channels: u16,
    sample_rate: u32,
    format: WavSampleFormat,
) -> Result<()> {
    let tmp = path.with_extension("wav.tmp");

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: match format {
            WavSampleFormat::Pcm16 => 16,
            WavSampleFormat::Float32 => 32,
        },
        sample_format: match format {
            WavSampleFormat::Pcm16 => hound::SampleFormat::Int,
            WavSampleFormat::Float32 => hound::SampleFormat::Float,
        },
    };

    {
        let file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        let mut writer = hound::WavWriter::new(BufWriter::new(file), spec)?;
        match format {
            WavSampleFormat::Pcm16 => {
                for &sample in interleaved {
                    let quantized = (sample.clamp(-1.0, 1.0) * 32_767.0).round() as i16;
                    writer.write_sample(quantized)?;
                }
            }
            WavSampleFormat::Float32 => {
                for &sample in interleaved {
                    writer.write_sample(sample)?;
                }
            }
        }
        writer.finalize()?;
    }

    // hound consumed the handle; reopen to fsync before the rename.
    File::open(&tmp)
        .and_then(|f| f.sync_all())
        .map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    sync_parent_dir(path);
    Ok(())
}

/// Write the JSON sidecar. Call only after the WAV exists on disk.
pub fn write_sidecar(path: &Path, record: &EvidenceRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| BarkError::Other(anyhow::anyhow!("sidecar encode: {e}")))?;
    write_atomic(path, &json)
}

/// Paths of the clip pair inside `dir` for a given basename.
pub fn clip_paths(dir: &Path, basename: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{basename}.wav")),
        dir.join(format!("{basename}.json")),
    )
}
