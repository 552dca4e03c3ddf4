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

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "medrag")]
#[command(version)]
#[command(about = "Retrieval-augmented generation service for medical reference corpora", long_about = None)]
pub struct Cli {
    /// Path to a config file (defaults to the system config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Verbose logging for this crate
        #[arg(long)]
        debug: bool,
    },

    /// Ingest documents from JSON files into the index
    Ingest {
        /// JSON files, each holding an array of {title, content, ...} objects
        files: Vec<PathBuf>,

        /// Chunking strategy: fixed_size, sentence, paragraph, semantic,
        /// clinical_sections
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Ask a question against the indexed corpus
    Query {
        question: String,

        /// Maximum number of passages to retrieve
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Maximum cosine distance for retrieved passages
        #[arg(long)]
        max_distance: Option<f32>,

        /// Answer style: general, diagnosis, advice, explanation
        #[arg(short, long, default_value = "general")]
        response_type: String,

        /// Stream the answer as it is generated
        #[arg(long)]
        stream: bool,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Search the index without generating an answer
    Search {
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Search type: vector, keyword, cross_modal
        #[arg(long, default_value = "vector")]
        search_type: String,

        /// Filter by document category
        #[arg(long)]
        category: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show index statistics
    Stats,
}
