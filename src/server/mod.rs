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

pub mod logging;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::Error;
use crate::pipeline::{QueryOptions, RagPipeline, SearchMode, SearchOptions};
use crate::types::{ChatMessage, ChunkStrategy, Document, ImageDocument, ResponseType};

/// Run the HTTP surface until ctrl-c.
pub async fn serve(pipeline: Arc<RagPipeline>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "listening");

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

fn router(pipeline: Arc<RagPipeline>) -> Router {
    Router::new()
        .route("/query", post(query))
        .route("/query/stream", post(query_stream))
        .route("/chat", post(chat))
        .route("/batch_query", post(batch_query))
        .route("/documents", post(add_documents))
        .route("/documents/images", post(add_images))
        .route("/search", post(search))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

/// Error taxonomy mapped onto HTTP statuses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidInput(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::UnsupportedModality(_)
        | Error::IncompatibleModality(_)
        | Error::DimensionMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::VectorizationBackend(_) | Error::StoreUnavailable(_) | Error::ModelUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Error::GenerationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    top_k: Option<usize>,
    max_distance: Option<f32>,
    #[serde(default)]
    response_type: ResponseType,
    category: Option<String>,
}

impl QueryRequest {
    fn options(&self) -> QueryOptions {
        QueryOptions {
            top_k: self.top_k,
            max_distance: self.max_distance,
            response_type: self.response_type,
            category: self.category.clone(),
        }
    }
}

async fn query(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let response = pipeline.query(&request.question, &request.options()).await?;
    Ok(Json(response).into_response())
}

async fn query_stream(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let options = request.options();
    let rx = pipeline.query_stream(request.question, options);

    // One JSON event per line; client disconnect drops the receiver and
    // cancels generation upstream.
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Some((Ok::<_, std::convert::Infallible>(Bytes::from(line)), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    top_k: Option<usize>,
    max_distance: Option<f32>,
    #[serde(default)]
    response_type: ResponseType,
}

async fn chat(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let options = QueryOptions {
        top_k: request.top_k,
        max_distance: request.max_distance,
        response_type: request.response_type,
        category: None,
    };
    let response = pipeline.chat(&request.messages, &options).await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct BatchQueryRequest {
    questions: Vec<String>,
    top_k: Option<usize>,
    max_distance: Option<f32>,
    #[serde(default)]
    response_type: ResponseType,
}

async fn batch_query(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<BatchQueryRequest>,
) -> Result<Response, ApiError> {
    let options = QueryOptions {
        top_k: request.top_k,
        max_distance: request.max_distance,
        response_type: request.response_type,
        category: None,
    };
    let items = pipeline.batch_query(&request.questions, &options).await;
    Ok(Json(json!({ "results": items })).into_response())
}

#[derive(Deserialize)]
struct DocumentInput {
    title: String,
    content: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Deserialize)]
struct DocumentsRequest {
    documents: Vec<DocumentInput>,
    strategy: Option<String>,
}

async fn add_documents(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<DocumentsRequest>,
) -> Result<Response, ApiError> {
    let strategy = match &request.strategy {
        Some(s) => Some(
            s.parse::<ChunkStrategy>()
                .map_err(|_| Error::InvalidInput(format!("unknown chunk strategy: {}", s)))?,
        ),
        None => None,
    };

    let documents: Vec<Document> = request
        .documents
        .into_iter()
        .map(|input| {
            let mut document =
                Document::new_text(input.title, input.category, input.source, input.content);
            document.metadata = input.metadata;
            document
        })
        .collect();

    let reports = pipeline.add_documents(documents, strategy).await;
    Ok(Json(json!({ "reports": reports })).into_response())
}

#[derive(Deserialize)]
struct ImageInput {
    title: String,
    image_base64: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ImagesRequest {
    images: Vec<ImageInput>,
}

async fn add_images(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<ImagesRequest>,
) -> Result<Response, ApiError> {
    let mut images = Vec::with_capacity(request.images.len());
    for input in request.images {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&input.image_base64)
            .map_err(|e| Error::InvalidInput(format!("invalid base64 image: {}", e)))?;
        images.push(ImageDocument {
            title: input.title,
            category: input.category,
            source: input.source,
            bytes,
            metadata: input.metadata,
        });
    }

    let reports = pipeline.add_images(images).await;
    Ok(Json(json!({ "reports": reports })).into_response())
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    top_k: Option<usize>,
    max_distance: Option<f32>,
    #[serde(default)]
    search_type: SearchMode,
    category: Option<String>,
}

async fn search(
    State(pipeline): State<Arc<RagPipeline>>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, ApiError> {
    let options = SearchOptions {
        mode: request.search_type,
        top_k: request.top_k,
        max_distance: request.max_distance,
        category: request.category,
    };
    let results = pipeline.search(&request.query, &options).await?;
    Ok(Json(json!({ "results": results })).into_response())
}

async fn stats(State(pipeline): State<Arc<RagPipeline>>) -> Result<Response, ApiError> {
    let stats = pipeline.stats().await?;
    Ok(Json(stats).into_response())
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&Error::InvalidInput("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::IncompatibleModality("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&Error::StoreUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::GenerationTimeout(120)),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_stream_events_serialize_one_per_line() {
        use crate::types::StreamEvent;
        let event = StreamEvent::Content {
            content: "frag".to_string(),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(
            line,
            r#"{"type":"content","content":"frag"}"#
        );
    }
}
