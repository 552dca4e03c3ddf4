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

#[cfg(test)]
mod query_tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::config::{Config, RetrievalConfig, SummarizeConfig};
use crate::error::{Error, Result};
use crate::generation::Generator;
use crate::index::{IndexEntry, VectorIndex};
use crate::rerank::{rerank, summarize_context};
use crate::types::{
    BatchQueryItem, ChatMessage, ChunkStrategy, Document, ImageDocument, IngestReport, Modality,
    PipelineStats, QueryResponse, ResponseType, RetrievalResult, SourceInfo, StreamEvent,
};
use crate::vectorizer::Vectorizer;

/// Questions longer than this are rejected before any backend call.
const MAX_QUESTION_BYTES: usize = 8 * 1024;

/// Excerpt length used for source attribution.
const EXCERPT_CHARS: usize = 200;

/// Per-query options; unset fields fall back to configured defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub max_distance: Option<f32>,
    pub response_type: ResponseType,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Vector,
    Keyword,
    /// Text query against the image index, via the projection registry.
    /// The index layer also supports the image-to-text direction, which
    /// has no HTTP or CLI surface until image queries are accepted.
    CrossModal,
}

impl std::str::FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vector" => Ok(SearchMode::Vector),
            "keyword" => Ok(SearchMode::Keyword),
            "cross_modal" => Ok(SearchMode::CrossModal),
            other => Err(Error::InvalidInput(format!(
                "unknown search type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub top_k: Option<usize>,
    pub max_distance: Option<f32>,
    pub category: Option<String>,
}

/// Lifecycle of one query, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    Received,
    Validated,
    QueryEmbedded,
    Retrieved,
    ContextBuilt,
    Generating,
    Answered,
    Failed,
}

/// The orchestrator: ties chunker, vectorizer, index, reranker, and
/// generator into the ingestion and query flows.
pub struct RagPipeline {
    vectorizer: Arc<dyn Vectorizer>,
    generator: Arc<dyn Generator>,
    index: Arc<VectorIndex>,
    chunker: Chunker,
    default_strategy: ChunkStrategy,
    retrieval: RetrievalConfig,
    summarize: SummarizeConfig,
    query_count: AtomicU64,
    started_at: Instant,
}

impl RagPipeline {
    pub fn new(
        vectorizer: Arc<dyn Vectorizer>,
        generator: Arc<dyn Generator>,
        index: Arc<VectorIndex>,
        config: &Config,
    ) -> Result<Self> {
        let default_strategy: ChunkStrategy = config.chunking.strategy.parse()?;

        Ok(Self {
            vectorizer,
            generator,
            index,
            chunker: Chunker::from_config(&config.chunking),
            default_strategy,
            retrieval: config.retrieval.clone(),
            summarize: config.summarize.clone(),
            query_count: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    fn trace_state(&self, query_id: &str, state: QueryState) {
        debug!(query_id, state = ?state, "query state");
    }

    fn validate_question(&self, question: &str) -> Result<()> {
        if question.trim().is_empty() {
            return Err(Error::InvalidInput("question is empty".to_string()));
        }
        if question.len() > MAX_QUESTION_BYTES {
            return Err(Error::InvalidInput(format!(
                "question exceeds {} bytes",
                MAX_QUESTION_BYTES
            )));
        }
        Ok(())
    }

    /// Answer one question against the indexed corpus.
    pub async fn query(&self, question: &str, opts: &QueryOptions) -> Result<QueryResponse> {
        let query_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        self.trace_state(&query_id, QueryState::Received);

        self.validate_question(question)?;
        self.trace_state(&query_id, QueryState::Validated);
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let (results, ungrounded) = self.retrieve(&query_id, question, opts).await?;
        let context = rerank(question, results, self.summarize.lexical_weight);
        let prompt = self.build_prompt(question, None, &context, opts.response_type, ungrounded);
        self.trace_state(&query_id, QueryState::ContextBuilt);

        self.trace_state(&query_id, QueryState::Generating);
        let answer = match self.generator.generate(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                self.trace_state(&query_id, QueryState::Failed);
                return Err(e);
            }
        };

        self.trace_state(&query_id, QueryState::Answered);
        info!(
            query_id,
            sources = context.len(),
            ungrounded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );

        Ok(QueryResponse {
            answer,
            sources: context.iter().map(source_info).collect(),
            ungrounded,
            query_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Answer one question as an ordered event stream: status updates, the
    /// retrieved documents exactly once before any generated content, then
    /// content fragments and a terminal `complete` or `error`.
    ///
    /// Dropping the receiver cancels the in-flight generation.
    pub fn query_stream(
        self: &Arc<Self>,
        question: String,
        opts: QueryOptions,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            if let Err(e) = pipeline.run_stream(&question, &opts, &tx).await {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        });

        rx
    }

    async fn run_stream(
        &self,
        question: &str,
        opts: &QueryOptions,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let query_id = uuid::Uuid::new_v4().to_string();
        self.trace_state(&query_id, QueryState::Received);

        self.validate_question(question)?;
        self.trace_state(&query_id, QueryState::Validated);
        self.query_count.fetch_add(1, Ordering::Relaxed);

        if tx
            .send(StreamEvent::Status {
                message: "retrieving context".to_string(),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let (results, ungrounded) = self.retrieve(&query_id, question, opts).await?;
        let context = rerank(question, results, self.summarize.lexical_weight);

        if tx
            .send(StreamEvent::Documents {
                documents: context.clone(),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        let prompt = self.build_prompt(question, None, &context, opts.response_type, ungrounded);
        self.trace_state(&query_id, QueryState::ContextBuilt);

        if tx
            .send(StreamEvent::Status {
                message: "generating answer".to_string(),
            })
            .await
            .is_err()
        {
            return Ok(());
        }

        self.trace_state(&query_id, QueryState::Generating);
        let mut fragments = self.generator.generate_stream(&prompt).await?;
        let mut answer = String::new();

        while let Some(fragment) = fragments.recv().await {
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.trace_state(&query_id, QueryState::Failed);
                    return Err(e);
                }
            };
            answer.push_str(&fragment);
            if tx
                .send(StreamEvent::Content { content: fragment })
                .await
                .is_err()
            {
                // Receiver gone: dropping `fragments` stops the generator.
                return Ok(());
            }
        }

        self.trace_state(&query_id, QueryState::Answered);
        let _ = tx.send(StreamEvent::Complete { answer, ungrounded }).await;
        Ok(())
    }

    /// One conversational turn. The last user message drives retrieval;
    /// earlier turns are folded into the prompt as plain text. No retrieval
    /// state is kept between turns.
    pub async fn chat(&self, messages: &[ChatMessage], opts: &QueryOptions) -> Result<QueryResponse> {
        let question = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidInput("no non-empty user message".to_string()))?;

        let query_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        self.validate_question(&question)?;
        self.query_count.fetch_add(1, Ordering::Relaxed);

        let (results, ungrounded) = self.retrieve(&query_id, &question, opts).await?;
        let context = rerank(&question, results, self.summarize.lexical_weight);

        let history = fold_history(messages);
        let prompt = self.build_prompt(
            &question,
            history.as_deref(),
            &context,
            opts.response_type,
            ungrounded,
        );

        let answer = self.generator.generate(&prompt).await?;

        Ok(QueryResponse {
            answer,
            sources: context.iter().map(source_info).collect(),
            ungrounded,
            query_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run several independent queries. One item's failure is recorded in
    /// its slot and never aborts the rest.
    pub async fn batch_query(
        &self,
        questions: &[String],
        opts: &QueryOptions,
    ) -> Vec<BatchQueryItem> {
        let mut items = Vec::with_capacity(questions.len());
        for question in questions {
            let item = match self.query(question, opts).await {
                Ok(result) => BatchQueryItem::Ok {
                    question: question.clone(),
                    result,
                },
                Err(e) => BatchQueryItem::Error {
                    question: question.clone(),
                    error: e.to_string(),
                },
            };
            items.push(item);
        }
        items
    }

    /// Ingest text documents: chunk, embed, index. Returns one report per
    /// document; a failing document never aborts the batch.
    pub async fn add_documents(
        &self,
        documents: Vec<Document>,
        strategy: Option<ChunkStrategy>,
    ) -> Vec<IngestReport> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        let mut reports = Vec::with_capacity(documents.len());

        for document in documents {
            let document_id = document.id.clone();
            let title = document.title.clone();
            let report = match self.ingest_document(document, strategy).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(document_id, error = %e, "document ingestion failed");
                    IngestReport {
                        document_id,
                        title,
                        chunks_indexed: 0,
                        deduplicated: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        reports
    }

    async fn ingest_document(
        &self,
        document: Document,
        strategy: ChunkStrategy,
    ) -> Result<IngestReport> {
        if document.raw_content.trim().is_empty() {
            return Err(Error::InvalidInput("document content is empty".to_string()));
        }

        let content_hash = hex::encode(Sha256::digest(document.raw_content.as_bytes()));
        if self.index.contains_hash(&content_hash).await? {
            debug!(document_id = document.id, "duplicate content, skipping");
            return Ok(IngestReport {
                document_id: document.id,
                title: document.title,
                chunks_indexed: 0,
                deduplicated: true,
                error: None,
            });
        }

        let chunks = self
            .chunker
            .chunk_document(&document.id, &document.raw_content, strategy);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.vectorizer.embed_texts(&texts).await?;

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry {
                chunk_id: chunk.id.clone(),
                document_id: document.id.clone(),
                text: chunk.text.clone(),
                title: document.title.clone(),
                source: document.source.clone(),
                category: document.category.clone(),
                content_hash: content_hash.clone(),
                metadata: document.metadata.clone(),
                embedding,
                seq: 0,
            })
            .collect();

        let indexed = entries.len();
        self.index.add_entries(Modality::Text, entries).await?;
        info!(
            document_id = document.id,
            chunks = indexed,
            "document indexed"
        );

        Ok(IngestReport {
            document_id: document.id,
            title: document.title,
            chunks_indexed: indexed,
            deduplicated: false,
            error: None,
        })
    }

    /// Ingest images into the image embedding space, one index entry each.
    pub async fn add_images(&self, images: Vec<ImageDocument>) -> Vec<IngestReport> {
        let mut reports = Vec::with_capacity(images.len());

        for image in images {
            let document_id = uuid::Uuid::new_v4().to_string();
            let title = image.title.clone();
            let report = match self.ingest_image(&document_id, image).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(document_id, error = %e, "image ingestion failed");
                    IngestReport {
                        document_id,
                        title,
                        chunks_indexed: 0,
                        deduplicated: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }

        reports
    }

    async fn ingest_image(&self, document_id: &str, image: ImageDocument) -> Result<IngestReport> {
        if image.bytes.is_empty() {
            return Err(Error::InvalidInput("image is empty".to_string()));
        }

        let content_hash = hex::encode(Sha256::digest(&image.bytes));
        if self.index.contains_hash(&content_hash).await? {
            return Ok(IngestReport {
                document_id: document_id.to_string(),
                title: image.title,
                chunks_indexed: 0,
                deduplicated: true,
                error: None,
            });
        }

        let embedding = self.vectorizer.embed_image(&image.bytes).await?;
        let entry = IndexEntry {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            text: image.title.clone(),
            title: image.title.clone(),
            source: image.source,
            category: image.category,
            content_hash,
            metadata: image.metadata,
            embedding,
            seq: 0,
        };

        self.index.add_entries(Modality::Image, vec![entry]).await?;

        Ok(IngestReport {
            document_id: document_id.to_string(),
            title: image.title,
            chunks_indexed: 1,
            deduplicated: false,
            error: None,
        })
    }

    /// Raw retrieval without generation, in vector, keyword, or cross-modal
    /// mode.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<RetrievalResult>> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("query is empty".to_string()));
        }
        let top_k = opts.top_k.unwrap_or(self.retrieval.top_k_default);
        let max_distance = opts
            .max_distance
            .unwrap_or(self.retrieval.max_distance_default);

        match opts.mode {
            SearchMode::Keyword => {
                self.index
                    .keyword_search(Modality::Text, query, top_k, opts.category.as_deref())
                    .await
            }
            SearchMode::Vector => {
                let embedded = self.vectorizer.embed_text(query).await?;
                self.index
                    .search(
                        Modality::Text,
                        &embedded,
                        top_k,
                        max_distance,
                        opts.category.as_deref(),
                    )
                    .await
            }
            SearchMode::CrossModal => {
                let embedded = self.vectorizer.embed_text(query).await?;
                self.index
                    .search_cross_modal(
                        Modality::Text,
                        Modality::Image,
                        &embedded,
                        top_k,
                        max_distance,
                    )
                    .await
            }
        }
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        let index_stats = self.index.stats().await?;
        Ok(PipelineStats {
            document_count: index_stats.document_count,
            chunk_count: index_stats.chunk_count,
            query_count: self.query_count.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
        })
    }

    /// Retrieval stage. Dependency failures and timeouts degrade to an
    /// empty context with `ungrounded = true` instead of failing the query.
    async fn retrieve(
        &self,
        query_id: &str,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<(Vec<RetrievalResult>, bool)> {
        let top_k = opts.top_k.unwrap_or(self.retrieval.top_k_default);
        let max_distance = opts
            .max_distance
            .unwrap_or(self.retrieval.max_distance_default);

        let embedded = match self.vectorizer.embed_text(question).await {
            Ok(v) => v,
            Err(e) if e.is_retrieval_degradable() => {
                warn!(query_id, error = %e, "embedding unavailable, answering ungrounded");
                return Ok((Vec::new(), true));
            }
            Err(e) => return Err(e),
        };
        self.trace_state(query_id, QueryState::QueryEmbedded);

        let budget = Duration::from_secs(self.retrieval.timeout_secs);
        let search = self.index.search(
            Modality::Text,
            &embedded,
            top_k,
            max_distance,
            opts.category.as_deref(),
        );

        match tokio::time::timeout(budget, search).await {
            Err(_) => {
                warn!(query_id, "retrieval timed out, answering ungrounded");
                Ok((Vec::new(), true))
            }
            Ok(Err(e)) if e.is_retrieval_degradable() => {
                warn!(query_id, error = %e, "retrieval failed, answering ungrounded");
                Ok((Vec::new(), true))
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(results)) => {
                self.trace_state(query_id, QueryState::Retrieved);
                Ok((results, false))
            }
        }
    }

    fn build_prompt(
        &self,
        question: &str,
        history: Option<&str>,
        context: &[RetrievalResult],
        response_type: ResponseType,
        ungrounded: bool,
    ) -> String {
        let mut prompt = String::from(preamble(response_type));
        prompt.push_str("\n\n");

        if let Some(history) = history {
            prompt.push_str("Conversation so far:\n");
            prompt.push_str(history);
            prompt.push_str("\n\n");
        }

        if context.is_empty() {
            if ungrounded {
                prompt.push_str(
                    "No reference material is available right now. Answer from general \
                     medical knowledge and say that sources could not be consulted.\n\n",
                );
            } else {
                prompt.push_str(
                    "No reference material matched this question. Answer from general \
                     medical knowledge and be explicit about uncertainty.\n\n",
                );
            }
        } else {
            prompt.push_str("Reference material:\n");
            for (i, result) in context.iter().enumerate() {
                let summary = summarize_context(question, &result.chunk_text, &self.summarize);
                prompt.push_str(&format!("[{}] {}: {}\n", i + 1, result.title, summary));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!("Question: {}\nAnswer:", question.trim()));
        prompt
    }
}

fn preamble(response_type: ResponseType) -> &'static str {
    match response_type {
        ResponseType::General => {
            "You are a careful medical assistant. Answer the question using the \
             reference material when it is provided, and cite which references you used."
        }
        ResponseType::Diagnosis => {
            "You are a careful medical assistant. Discuss plausible explanations for \
             the described symptoms, state your uncertainty, and recommend \
             professional evaluation for a definitive diagnosis."
        }
        ResponseType::Advice => {
            "You are a careful medical assistant. Give practical self-care guidance \
             grounded in the reference material, and name the warning signs that \
             require seeing a clinician."
        }
        ResponseType::Explanation => {
            "You are a careful medical assistant. Explain the concept in plain \
             language a patient can follow, using the reference material when provided."
        }
    }
}

fn source_info(result: &RetrievalResult) -> SourceInfo {
    SourceInfo {
        title: result.title.clone(),
        source: result.source.clone(),
        score: result.score,
        excerpt: excerpt(&result.chunk_text),
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// Render every turn except the final user message as plain text.
fn fold_history(messages: &[ChatMessage]) -> Option<String> {
    let last_user = messages.iter().rposition(|m| m.role == "user")?;
    if last_user == 0 {
        return None;
    }

    let lines: Vec<String> = messages[..last_user]
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.role, m.content.trim()))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
