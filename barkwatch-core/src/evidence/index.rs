//! Append-only evidence index.
//!
//! Single writer (the evidence worker); readers get cloned snapshots.
//! Every committed clip appends one JSON line to `index.jsonl` in the
//! evidence directory — written strictly after the WAV and sidecar exist,
//! so a crash never leaves an indexed record without its files. Existing
//! lines are loaded at open, which makes past sessions queryable;
//! compaction is out of scope.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{BarkError, Result};
use crate::evidence::sidecar::EvidenceRecord;

const INDEX_FILE: &str = "index.jsonl";

/// One indexed clip: the sidecar record plus attribution linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub record: EvidenceRecord,
    /// Fingerprint of the triggering event, when one was extracted.
    pub fp_id: Option<Uuid>,
    /// Matched dog at recording time, if any.
    pub dog_id: Option<String>,
    /// Every event merged into the clip.
    pub event_ids: Vec<Uuid>,
}

/// Ordered, append-only set of evidence records.
pub struct EvidenceIndex {
    entries: RwLock<Vec<IndexEntry>>,
    path: Option<PathBuf>,
}

impl EvidenceIndex {
    /// In-memory index with no backing file (tests, ephemeral sessions).
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            path: None,
        }
    }

    /// Open the index inside an evidence directory, loading any existing
    /// `index.jsonl`. Unparseable lines are skipped with a warning.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| BarkError::EvidenceIo {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = dir.join(INDEX_FILE);

        let mut entries = Vec::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| BarkError::EvidenceIo {
                path: path.clone(),
                source: e,
            })?;
            for (lineno, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<IndexEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(lineno, error = %e, "skipping unreadable index line"),
                }
            }
        }

        Ok(Self {
            entries: RwLock::new(entries),
            path: Some(path),
        })
    }

    /// Append one committed clip. The on-disk line is fsync'd before the
    /// in-memory set is updated, so readers never see an entry the disk
    /// does not have.
    pub fn append(&self, entry: IndexEntry) -> Result<()> {
        if let Some(path) = &self.path {
            let line = serde_json::to_string(&entry)
                .map_err(|e| BarkError::Other(anyhow::anyhow!("index encode: {e}")))?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| BarkError::EvidenceIo {
                    path: path.clone(),
                    source: e,
                })?;
            writeln!(file, "{line}").map_err(|e| BarkError::EvidenceIo {
                path: path.clone(),
                source: e,
            })?;
            file.sync_all().map_err(|e| BarkError::EvidenceIo {
                path: path.clone(),
                source: e,
            })?;
        }

        self.entries.write().push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Consistent snapshot of all entries, in append order.
    pub fn all(&self) -> Vec<IndexEntry> {
        self.entries.read().clone()
    }

    /// Clips recorded on a given UTC date.
    pub fn by_date(&self, date: NaiveDate) -> Vec<IndexEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.record.date_utc() == Some(date))
            .cloned()
            .collect()
    }

    /// Clip carrying a given fingerprint.
    pub fn by_fingerprint(&self, fp_id: Uuid) -> Option<IndexEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.fp_id == Some(fp_id))
            .cloned()
    }

    /// Clips attributed to a given dog.
    pub fn by_dog(&self, dog_id: &str) -> Vec<IndexEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.dog_id.as_deref() == Some(dog_id))
            .cloned()
            .collect()
    }
}
