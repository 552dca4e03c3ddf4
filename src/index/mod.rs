pub mod lance;
pub mod local;
pub mod projection;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{Modality, RetrievalResult};

pub use projection::ProjectionRegistry;

/// One indexed chunk with its embedding. `seq` is a monotonically increasing
/// insertion counter used to break distance ties deterministically.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub title: String,
    pub source: String,
    pub category: String,
    pub content_hash: String,
    pub metadata: BTreeMap<String, String>,
    pub embedding: Vec<f32>,
    pub seq: u64,
}

/// A backend candidate before thresholding and tie-break ordering.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    /// Cosine distance to the query, smaller is better.
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub document_count: usize,
    pub chunk_count: usize,
}

/// Storage layer under the index. Implementations only store and scan;
/// dimension checks, thresholds, and result ordering live in [`VectorIndex`].
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn add_batch(&self, modality: Modality, entries: Vec<IndexEntry>) -> Result<()>;

    /// Up to `limit` nearest entries by cosine distance. Order within the
    /// result is unspecified; the caller re-sorts.
    async fn search(
        &self,
        modality: Modality,
        query: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ScoredEntry>>;

    /// Remove every chunk of one document across all modalities. Returns the
    /// number of chunks removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    async fn contains_hash(&self, content_hash: &str) -> Result<bool>;

    /// Every entry of one modality, for keyword scoring and stats. Embedding
    /// vectors may be omitted.
    async fn scan(&self, modality: Modality) -> Result<Vec<IndexEntry>>;

    async fn stats(&self) -> Result<IndexStats>;

    /// Highest `seq` ever stored, for resuming the insertion counter.
    async fn max_seq(&self) -> Result<u64>;
}

/// The retrieval index: a storage backend plus the invariants the pipeline
/// relies on. Embedding dimensions are fixed per modality at construction;
/// results are ordered by `(distance, seq)` so equal-distance entries keep a
/// stable, insertion-ordered ranking across repeated queries.
pub struct VectorIndex {
    backend: Box<dyn VectorBackend>,
    dims: HashMap<Modality, usize>,
    projections: ProjectionRegistry,
    next_seq: AtomicU64,
}

impl VectorIndex {
    pub async fn new(
        backend: Box<dyn VectorBackend>,
        text_dim: usize,
        image_dim: usize,
        projections: ProjectionRegistry,
    ) -> Result<Self> {
        let mut dims = HashMap::new();
        if text_dim > 0 {
            dims.insert(Modality::Text, text_dim);
        }
        if image_dim > 0 {
            dims.insert(Modality::Image, image_dim);
        }

        let next_seq = backend.max_seq().await?.saturating_add(1);

        Ok(Self {
            backend,
            dims,
            projections,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    pub fn dim(&self, modality: Modality) -> Result<usize> {
        self.dims.get(&modality).copied().ok_or_else(|| {
            Error::UnsupportedModality(format!("no {} embedding space configured", modality))
        })
    }

    fn check_dim(&self, modality: Modality, vector: &[f32]) -> Result<()> {
        let expected = self.dim(modality)?;
        if vector.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Index a batch of chunks. Assigns insertion sequence numbers and
    /// rejects any embedding that violates the per-modality dimension.
    pub async fn add_entries(
        &self,
        modality: Modality,
        mut entries: Vec<IndexEntry>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &mut entries {
            self.check_dim(modality, &entry.embedding)?;
            entry.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        }
        self.backend.add_batch(modality, entries).await
    }

    /// Nearest-neighbor search within one modality.
    ///
    /// Results further than `max_distance` are dropped even when `top_k` is
    /// not reached; an empty result is a successful outcome.
    pub async fn search(
        &self,
        modality: Modality,
        query: &[f32],
        top_k: usize,
        max_distance: f32,
        category: Option<&str>,
    ) -> Result<Vec<RetrievalResult>> {
        self.check_dim(modality, query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        // Oversample so ties at the cutoff can be resolved by seq rather
        // than by whatever order the backend scanned them in.
        let limit = top_k * 2 + 8;
        let mut candidates = self.backend.search(modality, query, limit, category).await?;

        candidates.retain(|c| c.distance <= max_distance);
        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.entry.seq.cmp(&b.entry.seq))
        });
        candidates.truncate(top_k);

        Ok(candidates
            .into_iter()
            .map(|c| RetrievalResult {
                chunk_text: c.entry.text,
                score: 1.0 - c.distance,
                distance: c.distance,
                title: c.entry.title,
                source: c.entry.source,
                category: c.entry.category,
                document_id: c.entry.document_id,
                metadata: c.entry.metadata,
            })
            .collect())
    }

    /// Search another modality's index by projecting the query vector into
    /// that modality's embedding space first.
    pub async fn search_cross_modal(
        &self,
        query_modality: Modality,
        target_modality: Modality,
        query: &[f32],
        top_k: usize,
        max_distance: f32,
    ) -> Result<Vec<RetrievalResult>> {
        self.check_dim(query_modality, query)?;
        let target_dim = self.dim(target_modality)?;
        let projected =
            self.projections
                .project(query_modality, target_modality, query, target_dim)?;
        self.search(target_modality, &projected, top_k, max_distance, None)
            .await
    }

    /// Keyword search over the stored chunks: tokenized term-frequency
    /// scoring with title matches weighted three times text matches.
    pub async fn keyword_search(
        &self,
        modality: Modality,
        query: &str,
        top_k: usize,
        category: Option<&str>,
    ) -> Result<Vec<RetrievalResult>> {
        let terms = crate::rerank::tokenize(query);
        if terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.backend.scan(modality).await?;
        let mut scored: Vec<(f32, IndexEntry)> = entries
            .into_iter()
            .filter(|e| category.is_none_or(|c| e.category == c))
            .filter_map(|entry| {
                let title_tokens = crate::rerank::tokenize(&entry.title);
                let text_tokens = crate::rerank::tokenize(&entry.text);
                let mut hits = 0.0f32;
                for term in &terms {
                    let in_title = title_tokens.iter().filter(|t| *t == term).count();
                    let in_text = text_tokens.iter().filter(|t| *t == term).count();
                    hits += 3.0 * in_title as f32 + in_text as f32;
                }
                if hits > 0.0 {
                    Some((hits / terms.len() as f32, entry))
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.seq.cmp(&b.1.seq))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, entry)| RetrievalResult {
                chunk_text: entry.text,
                score,
                distance: (1.0 - score).max(0.0),
                title: entry.title,
                source: entry.source,
                category: entry.category,
                document_id: entry.document_id,
                metadata: entry.metadata,
            })
            .collect())
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        self.backend.delete_document(document_id).await
    }

    pub async fn contains_hash(&self, content_hash: &str) -> Result<bool> {
        self.backend.contains_hash(content_hash).await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.backend.stats().await
    }
}
