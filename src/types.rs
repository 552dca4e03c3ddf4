// Copyright 2026 Medrag Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Content modality. Embedding dimension is fixed per modality for the
/// lifetime of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Text => write!(f, "text"),
            Modality::Image => write!(f, "image"),
        }
    }
}

/// A document owned by the knowledge base. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub category: String,
    pub source: String,
    pub raw_content: String,
    pub content_kind: Modality,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn new_text(
        title: impl Into<String>,
        category: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            category: category.into(),
            source: source.into(),
            raw_content: content.into(),
            content_kind: Modality::Text,
            metadata: BTreeMap::new(),
        }
    }
}

/// Raw image submitted for ingestion. Bytes arrive already decoded; the
/// HTTP layer handles base64 transport encoding.
#[derive(Debug, Clone)]
pub struct ImageDocument {
    pub title: String,
    pub category: String,
    pub source: String,
    pub bytes: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

/// A retrieval-sized passage derived from one document.
///
/// `start_offset`/`end_offset` are byte offsets into the source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub strategy_used: ChunkStrategy,
    /// Set when a clinical section could not be split below `max_chunk_size`
    /// without breaking a semantic unit.
    pub oversized: bool,
}

/// Chunking strategy, selectable per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    FixedSize,
    Sentence,
    Paragraph,
    Semantic,
    ClinicalSections,
}

impl std::str::FromStr for ChunkStrategy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_size" => Ok(ChunkStrategy::FixedSize),
            "sentence" => Ok(ChunkStrategy::Sentence),
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "semantic" => Ok(ChunkStrategy::Semantic),
            "clinical_sections" => Ok(ChunkStrategy::ClinicalSections),
            other => Err(crate::error::Error::Config(format!(
                "unknown chunk strategy: {}",
                other
            ))),
        }
    }
}

/// One ranked retrieval hit. Ephemeral, produced per query.
///
/// `distance` is cosine distance (smaller is better); `score` is `1 - distance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_text: String,
    pub score: f32,
    pub distance: f32,
    pub title: String,
    pub source: String,
    pub category: String,
    pub document_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A single conversation turn for `chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Prompt framing selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    General,
    Diagnosis,
    Advice,
    Explanation,
}

impl std::str::FromStr for ResponseType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(ResponseType::General),
            "diagnosis" => Ok(ResponseType::Diagnosis),
            "advice" => Ok(ResponseType::Advice),
            "explanation" => Ok(ResponseType::Explanation),
            other => Err(crate::error::Error::InvalidInput(format!(
                "unknown response type: {}",
                other
            ))),
        }
    }
}

/// Source attribution attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub title: String,
    pub source: String,
    pub score: f32,
    pub excerpt: String,
}

/// Result of one `query` or one `chat` turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceInfo>,
    /// True when retrieval failed or timed out and the answer was generated
    /// without supporting context.
    pub ungrounded: bool,
    pub query_time_ms: u64,
}

/// Per-item outcome of `batch_query`. One item's failure never aborts the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchQueryItem {
    Ok { question: String, result: QueryResponse },
    Error { question: String, error: String },
}

/// Per-document outcome of an ingestion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub title: String,
    pub chunks_indexed: usize,
    /// True when an identical document (same content hash) was already indexed.
    pub deduplicated: bool,
    pub error: Option<String>,
}

/// Ordered events emitted by `query_stream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Status { message: String },
    /// Emitted exactly once, immediately after retrieval and before the
    /// first content fragment.
    Documents { documents: Vec<RetrievalResult> },
    Content { content: String },
    Complete { answer: String, ungrounded: bool },
    Error { message: String },
}

/// Snapshot for `GET /stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub query_count: u64,
    pub uptime_secs: u64,
}
