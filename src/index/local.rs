use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::index::{IndexEntry, IndexStats, ScoredEntry, VectorBackend};
use crate::types::Modality;

/// In-memory backend with brute-force cosine scans. Used for tests and for
/// deployments too small to justify an on-disk index.
#[derive(Default)]
pub struct LocalArrayBackend {
    entries: RwLock<HashMap<Modality, Vec<IndexEntry>>>,
}

impl LocalArrayBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorBackend for LocalArrayBackend {
    async fn add_batch(&self, modality: Modality, mut entries: Vec<IndexEntry>) -> Result<()> {
        let mut guard = self.entries.write().await;
        guard.entry(modality).or_default().append(&mut entries);
        Ok(())
    }

    async fn search(
        &self,
        modality: Modality,
        query: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ScoredEntry>> {
        let guard = self.entries.read().await;
        let Some(entries) = guard.get(&modality) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ScoredEntry> = entries
            .iter()
            .filter(|e| category.is_none_or(|c| e.category == c))
            .map(|e| ScoredEntry {
                entry: e.clone(),
                distance: cosine_distance(&e.embedding, query),
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut guard = self.entries.write().await;
        let mut removed = 0;
        for entries in guard.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.document_id != document_id);
            removed += before - entries.len();
        }
        Ok(removed)
    }

    async fn contains_hash(&self, content_hash: &str) -> Result<bool> {
        let guard = self.entries.read().await;
        Ok(guard
            .values()
            .flatten()
            .any(|e| e.content_hash == content_hash))
    }

    async fn scan(&self, modality: Modality) -> Result<Vec<IndexEntry>> {
        let guard = self.entries.read().await;
        Ok(guard.get(&modality).cloned().unwrap_or_default())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let guard = self.entries.read().await;
        let chunk_count = guard.values().map(|v| v.len()).sum();
        let document_count = guard
            .values()
            .flatten()
            .map(|e| e.document_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        Ok(IndexStats {
            document_count,
            chunk_count,
        })
    }

    async fn max_seq(&self) -> Result<u64> {
        let guard = self.entries.read().await;
        Ok(guard.values().flatten().map(|e| e.seq).max().unwrap_or(0))
    }
}
