use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::generation::testing::ScriptedGenerator;
use crate::generation::Generator;
use crate::index::local::LocalArrayBackend;
use crate::index::{ProjectionRegistry, VectorIndex};
use crate::pipeline::{QueryOptions, RagPipeline, SearchMode, SearchOptions};
use crate::types::{BatchQueryItem, ChatMessage, ChunkStrategy, Document, StreamEvent};
use crate::vectorizer::testing::HashVectorizer;
use crate::vectorizer::Vectorizer;

fn test_config() -> Config {
    let mut config = Config::default();
    // Hashed test embeddings are noisy; keep everything retrievable.
    config.retrieval.max_distance_default = 2.0;
    config.chunking.min_chunk_size = 2;
    config
}

async fn test_pipeline(generator: impl Generator + 'static) -> Arc<RagPipeline> {
    let index = VectorIndex::new(
        Box::new(LocalArrayBackend::new()),
        16,
        8,
        ProjectionRegistry::empty(),
    )
    .await
    .unwrap();

    Arc::new(
        RagPipeline::new(
            Arc::new(HashVectorizer::default()),
            Arc::new(generator),
            Arc::new(index),
            &test_config(),
        )
        .unwrap(),
    )
}

fn corpus() -> Vec<Document> {
    vec![
        Document::new_text(
            "Fever management",
            "general",
            "handbook",
            "Findings: fever responds to rest and fluids. Impression: most fevers are self limiting viral illness.",
        ),
        Document::new_text(
            "Hypertension basics",
            "cardiology",
            "handbook",
            "History: elevated blood pressure over months. Plan: lifestyle change first, then medication if needed.",
        ),
    ]
}

#[tokio::test]
async fn test_query_returns_grounded_answer() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["Rest and fluids."])).await;
    let reports = pipeline.add_documents(corpus(), None).await;
    assert!(reports.iter().all(|r| r.error.is_none()));

    let response = pipeline
        .query("how should fever be managed", &QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(response.answer, "Rest and fluids.");
    assert!(!response.ungrounded);
    assert!(!response.sources.is_empty());
}

#[tokio::test]
async fn test_clinical_report_indexes_as_two_sections() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    let document = Document::new_text(
        "Radiology report",
        "radiology",
        "pacs",
        "Findings: mild inflammation. Impression: likely viral infection.",
    );

    let reports = pipeline
        .add_documents(vec![document], Some(ChunkStrategy::ClinicalSections))
        .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].chunks_indexed, 2);

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.chunk_count, 2);
}

#[tokio::test]
async fn test_impression_question_retrieves_impression_section() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    let document = Document::new_text(
        "Radiology report",
        "radiology",
        "pacs",
        "Findings: unremarkable. Impression: the impression is what looks like viral infection.",
    );
    pipeline
        .add_documents(vec![document], Some(ChunkStrategy::ClinicalSections))
        .await;

    let opts = SearchOptions {
        top_k: Some(1),
        ..Default::default()
    };
    let results = pipeline
        .search("what is the impression?", &opts)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].chunk_text.starts_with("Impression:"));
}

#[tokio::test]
async fn test_empty_question_is_rejected_before_backends() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    let err = pipeline
        .query("   ", &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let oversized = "q".repeat(10_000);
    let err = pipeline
        .query(&oversized, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_batch_isolates_per_item_failures() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["answer"])).await;
    pipeline.add_documents(corpus(), None).await;

    let questions = vec!["what lowers blood pressure".to_string(), "".to_string()];
    let items = pipeline
        .batch_query(&questions, &QueryOptions::default())
        .await;

    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], BatchQueryItem::Ok { .. }));
    match &items[1] {
        BatchQueryItem::Error { error, .. } => assert!(error.contains("invalid input")),
        other => panic!("expected error item, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_matches_sync_answer_and_event_order() {
    let fragments = &["Lifestyle ", "changes ", "come first."];
    let pipeline = test_pipeline(ScriptedGenerator::answering(fragments)).await;
    pipeline.add_documents(corpus(), None).await;

    let opts = QueryOptions::default();
    let sync = pipeline
        .query("treatment for hypertension", &opts)
        .await
        .unwrap();

    let mut rx = pipeline.query_stream("treatment for hypertension".to_string(), opts);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let documents_at = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Documents { .. }))
        .expect("documents event missing");
    let first_content = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Content { .. }))
        .expect("content events missing");
    assert!(documents_at < first_content);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Documents { .. }))
            .count(),
        1
    );

    match events.last() {
        Some(StreamEvent::Complete { answer, ungrounded }) => {
            assert_eq!(answer, &sync.answer);
            assert!(!ungrounded);
        }
        other => panic!("expected complete event, got {:?}", other),
    }

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, sync.answer);
}

#[tokio::test]
async fn test_invalid_stream_question_emits_error_event() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    let mut rx = pipeline.query_stream("".to_string(), QueryOptions::default());

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Error { .. }));
}

struct DownVectorizer;

#[async_trait]
impl Vectorizer for DownVectorizer {
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::VectorizationBackend("connection refused".to_string()))
    }
    async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::VectorizationBackend("connection refused".to_string()))
    }
    async fn embed_image(&self, _image: &[u8]) -> Result<Vec<f32>> {
        Err(Error::VectorizationBackend("connection refused".to_string()))
    }
    async fn embed_images(&self, _images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        Err(Error::VectorizationBackend("connection refused".to_string()))
    }
    fn text_dim(&self) -> usize {
        16
    }
    fn image_dim(&self) -> usize {
        8
    }
}

#[tokio::test]
async fn test_retrieval_outage_degrades_to_ungrounded_answer() {
    let index = VectorIndex::new(
        Box::new(LocalArrayBackend::new()),
        16,
        8,
        ProjectionRegistry::empty(),
    )
    .await
    .unwrap();
    let pipeline = RagPipeline::new(
        Arc::new(DownVectorizer),
        Arc::new(ScriptedGenerator::answering(&["General advice only."])),
        Arc::new(index),
        &test_config(),
    )
    .unwrap();

    let response = pipeline
        .query("is this safe", &QueryOptions::default())
        .await
        .unwrap();

    assert!(response.ungrounded);
    assert!(response.sources.is_empty());
    assert_eq!(response.answer, "General advice only.");
}

#[tokio::test]
async fn test_generation_failure_is_fatal() {
    let pipeline = test_pipeline(ScriptedGenerator::failing(|| {
        Error::ModelUnavailable("down".to_string())
    }))
    .await;
    pipeline.add_documents(corpus(), None).await;

    let err = pipeline
        .query("anything at all", &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelUnavailable(_)));
}

#[tokio::test]
async fn test_reingesting_identical_content_is_deduplicated() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;

    let first = pipeline.add_documents(corpus(), None).await;
    assert!(first.iter().all(|r| !r.deduplicated));

    let second = pipeline.add_documents(corpus(), None).await;
    assert!(second.iter().all(|r| r.deduplicated));
    assert!(second.iter().all(|r| r.chunks_indexed == 0));

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.document_count, 2);
}

#[tokio::test]
async fn test_empty_document_reports_error_without_aborting_batch() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    let documents = vec![
        Document::new_text("Empty", "general", "unit", "   "),
        Document::new_text("Valid", "general", "unit", "Plain note with content."),
    ];

    let reports = pipeline.add_documents(documents, None).await;
    assert_eq!(reports.len(), 2);
    assert!(reports[0].error.is_some());
    assert!(reports[1].error.is_none());
    assert!(reports[1].chunks_indexed > 0);
}

#[tokio::test]
async fn test_chat_requires_a_user_message() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    let messages = vec![ChatMessage {
        role: "assistant".to_string(),
        content: "hello".to_string(),
    }];
    let err = pipeline
        .chat(&messages, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_chat_answers_last_user_turn() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["It can recur."])).await;
    pipeline.add_documents(corpus(), None).await;

    let messages = vec![
        ChatMessage {
            role: "user".to_string(),
            content: "how is fever managed".to_string(),
        },
        ChatMessage {
            role: "assistant".to_string(),
            content: "Rest and fluids.".to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: "can it come back".to_string(),
        },
    ];

    let response = pipeline.chat(&messages, &QueryOptions::default()).await.unwrap();
    assert_eq!(response.answer, "It can recur.");
    assert!(!response.ungrounded);
}

#[tokio::test]
async fn test_keyword_search_weights_title_matches() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    pipeline.add_documents(corpus(), None).await;

    let opts = SearchOptions {
        mode: SearchMode::Keyword,
        ..Default::default()
    };
    let results = pipeline.search("hypertension", &opts).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].title, "Hypertension basics");
}

#[tokio::test]
async fn test_query_counter_tracks_all_entry_points() {
    let pipeline = test_pipeline(ScriptedGenerator::answering(&["ok"])).await;
    pipeline.add_documents(corpus(), None).await;

    pipeline
        .query("first", &QueryOptions::default())
        .await
        .unwrap();
    let questions = vec!["second".to_string()];
    pipeline
        .batch_query(&questions, &QueryOptions::default())
        .await;

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.query_count, 2);
}
