//! Nearest-centroid matching of event embeddings to known dogs.
//!
//! The centroid index is an immutable snapshot swapped behind a lock:
//! matching clones the current `Arc` and never blocks a concurrent
//! rebuild. Rebuilds are driven by the external catalog signalling that a
//! dog's tagged set changed, via [`FingerprintMatcher::refresh_centroids`].

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::FingerprintConfig;

/// Read-only view of the external dog catalog.
///
/// The relational catalog itself (profiles, tagging, rejection workflows)
/// lives outside the core; this seam only exposes what centroid builds
/// need.
pub trait ProfileCatalog: Send + Sync + 'static {
    /// Known dog identifiers.
    fn dog_ids(&self) -> Vec<String>;

    /// Embeddings of the dog's curated (tagged) fingerprints.
    fn tagged_embeddings(&self, dog_id: &str) -> Vec<Vec<f32>>;
}

/// One dog's centroid.
#[derive(Debug, Clone)]
struct CentroidEntry {
    dog_id: String,
    /// L2-normalized mean of the member embeddings.
    centroid: Vec<f32>,
}

/// Immutable centroid snapshot.
#[derive(Debug, Default)]
pub struct CentroidIndex {
    entries: Vec<CentroidEntry>,
}

impl CentroidIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A successful nearest-centroid match.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidMatch {
    pub dog_id: String,
    /// `1 − distance/threshold`, in (0, 1].
    pub confidence: f32,
}

/// Matches event embeddings against per-dog centroids.
pub struct FingerprintMatcher {
    catalog: Arc<dyn ProfileCatalog>,
    index: RwLock<Arc<CentroidIndex>>,
    match_threshold: f32,
}

impl FingerprintMatcher {
    pub fn new(config: &FingerprintConfig, catalog: Arc<dyn ProfileCatalog>) -> Self {
        let matcher = Self {
            catalog,
            index: RwLock::new(Arc::new(CentroidIndex::default())),
            match_threshold: config.match_threshold,
        };
        matcher.refresh_centroids(None);
        matcher
    }

    /// Rebuild centroids from the catalog.
    ///
    /// `dog_id = None` rebuilds the whole index; a specific id rebuilds
    /// only that dog's entry. Calling twice with an unchanged catalog is
    /// equivalent to calling once.
    pub fn refresh_centroids(&self, dog_id: Option<&str>) {
        let current = Arc::clone(&self.index.read());

        let rebuilt: Vec<CentroidEntry> = match dog_id {
            None => self
                .catalog
                .dog_ids()
                .into_iter()
                .filter_map(|id| self.build_entry(&id))
                .collect(),
            Some(target) => {
                let mut entries: Vec<CentroidEntry> = current
                    .entries
                    .iter()
                    .filter(|e| e.dog_id != target)
                    .cloned()
                    .collect();
                if let Some(entry) = self.build_entry(target) {
                    entries.push(entry);
                }
                entries
            }
        };

        info!(
            dogs = rebuilt.len(),
            scope = dog_id.unwrap_or("all"),
            "centroid index rebuilt"
        );
        *self.index.write() = Arc::new(CentroidIndex { entries: rebuilt });
    }

    fn build_entry(&self, dog_id: &str) -> Option<CentroidEntry> {
        let members = self.catalog.tagged_embeddings(dog_id);
        let first = members.first()?;
        let dim = first.len();
        if dim == 0 {
            return None;
        }

        let mut centroid = vec![0f32; dim];
        let mut count = 0usize;
        for member in &members {
            if member.len() != dim {
                debug!(dog_id, "skipping embedding with mismatched dimension");
                continue;
            }
            for (acc, &v) in centroid.iter_mut().zip(member) {
                *acc += v;
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        for v in &mut centroid {
            *v /= count as f32;
        }

        let norm = centroid.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return None;
        }
        for v in &mut centroid {
            *v /= norm;
        }

        Some(CentroidEntry {
            dog_id: dog_id.to_string(),
            centroid,
        })
    }

    /// Nearest centroid within the match threshold, by cosine distance.
    pub fn match_embedding(&self, embedding: &[f32]) -> Option<CentroidMatch> {
        let index = Arc::clone(&self.index.read());

        let mut best: Option<(f32, &CentroidEntry)> = None;
        for entry in &index.entries {
            let distance = cosine_distance(embedding, &entry.centroid);
            match best {
                Some((d, _)) if d <= distance => {}
                _ => best = Some((distance, entry)),
            }
        }

        let (distance, entry) = best?;
        if distance > self.match_threshold {
            return None;
        }
        Some(CentroidMatch {
            dog_id: entry.dog_id.clone(),
            confidence: 1.0 - distance / self.match_threshold,
        })
    }

    /// Snapshot of the current index size (for status/debugging).
    pub fn centroid_count(&self) -> usize {
        self.index.read().len()
    }
}

/// `1 − cos(a, b)`, clamped into [0, 2].
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 2.0;
    }
    (1.0 - dot / (na * nb)).clamp(0.0, 2.0)
}
