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
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Deserialize;

use crate::cli::Commands;
use crate::config::Config;
use crate::generation::HttpGenerator;
use crate::index::lance::LanceBackend;
use crate::index::local::LocalArrayBackend;
use crate::index::{ProjectionRegistry, VectorBackend, VectorIndex};
use crate::pipeline::{QueryOptions, RagPipeline, SearchOptions};
use crate::types::{
    ChunkStrategy, Document, PipelineStats, QueryResponse, RetrievalResult, StreamEvent,
};
use crate::vectorizer::{HttpVectorizer, Vectorizer};

pub async fn execute(config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { host, port, debug } => serve(config, host, port, debug).await,
        Commands::Ingest { files, strategy } => ingest(config, files, strategy).await,
        Commands::Query {
            question,
            top_k,
            max_distance,
            response_type,
            stream,
            format,
        } => {
            query(
                config,
                question,
                top_k,
                max_distance,
                response_type,
                stream,
                format,
            )
            .await
        }
        Commands::Search {
            query,
            top_k,
            search_type,
            category,
            format,
        } => search(config, query, top_k, search_type, category, format).await,
        Commands::Stats => stats(config).await,
    }
}

/// Wire vectorizer, generator, store, and projections into a pipeline.
pub async fn build_pipeline(config: &Config) -> Result<Arc<RagPipeline>> {
    let vectorizer = Arc::new(
        HttpVectorizer::connect(&config.vectorizer)
            .await
            .context("cannot reach the embedding backend")?,
    );
    let generator = Arc::new(HttpGenerator::new(&config.generation)?);

    let projections = match &config.store.projection_path {
        Some(path) => ProjectionRegistry::load(path)?,
        None => ProjectionRegistry::empty(),
    };

    let backend: Box<dyn VectorBackend> = match config.store.backend.as_str() {
        "lance" => Box::new(
            LanceBackend::open(
                &config.store_path()?,
                vectorizer.text_dim(),
                vectorizer.image_dim(),
            )
            .await?,
        ),
        "memory" => Box::new(LocalArrayBackend::new()),
        other => anyhow::bail!("unknown store backend: {}", other),
    };

    let index = VectorIndex::new(
        backend,
        vectorizer.text_dim(),
        vectorizer.image_dim(),
        projections,
    )
    .await?;

    Ok(Arc::new(RagPipeline::new(
        vectorizer,
        generator,
        Arc::new(index),
        config,
    )?))
}

async fn serve(
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
    debug: bool,
) -> Result<()> {
    crate::server::logging::init_server_logging(config.server.log_dir.clone(), debug)?;

    let pipeline = build_pipeline(config).await?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    crate::server::serve(pipeline, &host, port).await
}

#[derive(Deserialize)]
struct IngestDocument {
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

async fn ingest(config: &Config, files: Vec<PathBuf>, strategy: Option<String>) -> Result<()> {
    if files.is_empty() {
        anyhow::bail!("no input files given");
    }
    let strategy = strategy
        .map(|s| s.parse::<ChunkStrategy>())
        .transpose()?;

    let pipeline = build_pipeline(config).await?;

    for file in files {
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("cannot read {}", file.display()))?;
        let inputs: Vec<IngestDocument> = serde_json::from_str(&content)
            .with_context(|| format!("invalid document file {}", file.display()))?;

        let documents: Vec<Document> = inputs
            .into_iter()
            .map(|input| {
                let source = if input.source.is_empty() {
                    file.display().to_string()
                } else {
                    input.source
                };
                let mut document =
                    Document::new_text(input.title, input.category, source, input.content);
                document.metadata = input.metadata;
                document
            })
            .collect();

        let reports = pipeline.add_documents(documents, strategy).await;
        println!("{}", file.display().to_string().bold());
        for report in &reports {
            if let Some(error) = &report.error {
                println!("  {} {}: {}", "✗".red(), report.title, error);
            } else if report.deduplicated {
                println!("  {} {} (already indexed)", "=".yellow(), report.title);
            } else {
                println!(
                    "  {} {} ({} chunks)",
                    "✓".green(),
                    report.title,
                    report.chunks_indexed
                );
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn query(
    config: &Config,
    question: String,
    top_k: Option<usize>,
    max_distance: Option<f32>,
    response_type: String,
    stream: bool,
    format: String,
) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let options = QueryOptions {
        top_k,
        max_distance,
        response_type: response_type.parse()?,
        category: None,
    };

    if stream {
        return stream_query(&pipeline, question, options).await;
    }

    let response = pipeline.query(&question, &options).await?;
    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&response)?),
        _ => print!("{}", format_response(&response)),
    }
    Ok(())
}

async fn stream_query(
    pipeline: &Arc<RagPipeline>,
    question: String,
    options: QueryOptions,
) -> Result<()> {
    let mut rx = pipeline.query_stream(question, options);
    let mut stdout = std::io::stdout();

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Status { message } => {
                eprintln!("{}", message.bright_black());
            }
            StreamEvent::Documents { documents } => {
                eprintln!(
                    "{}",
                    format!("{} passages retrieved", documents.len()).bright_black()
                );
            }
            StreamEvent::Content { content } => {
                print!("{}", content);
                stdout.flush().ok();
            }
            StreamEvent::Complete { ungrounded, .. } => {
                println!();
                if ungrounded {
                    eprintln!(
                        "{}",
                        "note: sources were unavailable, answer is ungrounded".yellow()
                    );
                }
            }
            StreamEvent::Error { message } => {
                anyhow::bail!(message);
            }
        }
    }

    Ok(())
}

async fn search(
    config: &Config,
    query: String,
    top_k: Option<usize>,
    search_type: String,
    category: Option<String>,
    format: String,
) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let options = SearchOptions {
        mode: search_type.parse()?,
        top_k,
        max_distance: None,
        category,
    };

    let results = pipeline.search(&query, &options).await?;
    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&results)?),
        _ => print!("{}", format_search_results(&results)),
    }
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let stats = pipeline.stats().await?;
    print!("{}", format_stats(&stats));
    Ok(())
}

fn format_response(response: &QueryResponse) -> String {
    let mut output = String::new();

    output.push_str(&response.answer);
    output.push('\n');

    if response.ungrounded {
        output.push_str(
            &"note: sources were unavailable, answer is ungrounded\n"
                .yellow()
                .to_string(),
        );
    }

    if !response.sources.is_empty() {
        output.push('\n');
        output.push_str(&"Sources".bold().to_string());
        output.push('\n');
        for source in &response.sources {
            let score_pct = (source.score * 100.0) as i32;
            output.push_str(&format!(
                "  {} {} ({}%)\n",
                "•".cyan(),
                source.title.blue(),
                score_pct
            ));
        }
    }

    output.push_str(&format!("{} ms\n", response.query_time_ms).bright_black().to_string());
    output
}

fn format_search_results(results: &[RetrievalResult]) -> String {
    if results.is_empty() {
        return "No results found\n".to_string();
    }

    let mut output = String::new();
    for result in results {
        output.push_str(&"━".repeat(60));
        output.push('\n');
        output.push_str(&result.title.blue().bold().to_string());
        output.push('\n');
        output.push_str(&result.source.bright_black().to_string());
        output.push('\n');

        let preview: String = result.chunk_text.chars().take(200).collect();
        output.push_str(preview.trim_end());
        if result.chunk_text.chars().count() > 200 {
            output.push_str("...");
        }
        output.push('\n');

        let score_pct = (result.score * 100.0) as i32;
        output.push_str(&format!("{}% relevant", score_pct).green().to_string());
        output.push_str("\n\n");
    }

    output
}

fn format_stats(stats: &PipelineStats) -> String {
    let mut output = String::new();
    output.push_str(&"Index Statistics".bold().to_string());
    output.push('\n');
    output.push_str(&format!("Documents: {}\n", stats.document_count));
    output.push_str(&format!("Chunks: {}\n", stats.chunk_count));
    output.push_str(&format!("Queries served: {}\n", stats.query_count));
    output.push_str(&format!("Uptime: {}s\n", stats.uptime_secs));
    output
}
