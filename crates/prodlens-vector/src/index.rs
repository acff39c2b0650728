//! In-memory passage index with brute-force cosine similarity search.
//!
//! Every entry carries the passage text and a flat metadata object. Searches
//! apply the metadata filter first and only then rank and truncate, so a
//! narrow filter still returns up to `top_k` passages.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::services::PassageSearch;
use prodlens_core::types::{MetadataFilter, RetrievedPassage};

/// One stored passage. Also the line format of JSONL snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub embedding: Vec<f32>,
}

/// Thread-safe in-memory vector index.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    entries: Arc<RwLock<HashMap<String, IndexEntry>>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any entry with the same id.
    ///
    /// All embeddings in one index must have the same length.
    pub fn insert(&self, entry: IndexEntry) -> Result<()> {
        if entry.embedding.is_empty() {
            return Err(ProdLensError::Retrieval(format!(
                "entry {} has an empty embedding",
                entry.id
            )));
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|e| ProdLensError::Retrieval(format!("Lock poisoned: {}", e)))?;
        if let Some(existing) = entries.values().find(|e| e.id != entry.id) {
            if existing.embedding.len() != entry.embedding.len() {
                return Err(ProdLensError::Retrieval(format!(
                    "entry {} has {} dimensions, index has {}",
                    entry.id,
                    entry.embedding.len(),
                    existing.embedding.len()
                )));
            }
        }
        entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Nearest entries to `query` among those matching `filter`, best first.
    pub fn search_filtered(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedPassage>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| ProdLensError::Retrieval(format!("Lock poisoned: {}", e)))?;
        if let Some(dimensions) = entries.values().next().map(|e| e.embedding.len()) {
            if query.len() != dimensions {
                return Err(ProdLensError::Retrieval(format!(
                    "query has {} dimensions, index has {}",
                    query.len(),
                    dimensions
                )));
            }
        }

        let mut scored: Vec<(f64, &IndexEntry)> = entries
            .values()
            .filter(|entry| filter.matches(&entry.metadata))
            .map(|entry| (cosine_similarity(query, &entry.embedding), entry))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, entry)| RetrievedPassage {
                content: entry.content.clone(),
                metadata: entry.metadata.clone(),
                score: score as f32,
            })
            .collect())
    }

    /// Embedding length shared by every entry, `None` while empty.
    pub fn dimensions(&self) -> Option<usize> {
        self.entries
            .read()
            .ok()
            .and_then(|e| e.values().next().map(|entry| entry.embedding.len()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load entries from a JSONL snapshot, one [`IndexEntry`] per line.
    ///
    /// Blank lines are skipped. A malformed line fails the whole load with
    /// its line number.
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let index = Self::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = serde_json::from_str(&line).map_err(|e| {
                ProdLensError::Retrieval(format!("{} line {}: {}", path.display(), n + 1, e))
            })?;
            index.insert(entry)?;
        }
        info!(path = %path.display(), entries = index.len(), "Vector index loaded");
        Ok(index)
    }
}

#[async_trait]
impl PassageSearch for VectorIndex {
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedPassage>> {
        self.search_filtered(query, top_k, filter)
    }
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
