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

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Embedding backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizerConfig {
    pub endpoint: String,
    pub text_model: String,
    pub image_model: String,
    pub timeout_secs: u64,
    pub batch_size: usize,
}

impl VectorizerConfig {
    /// An empty image model selects a text-only deployment.
    pub fn image_enabled(&self) -> bool {
        !self.image_model.trim().is_empty()
    }
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9100".to_string(),
            text_model: "text2vec-base-medical".to_string(),
            image_model: "clip-vit-base".to_string(),
            timeout_secs: 30,
            batch_size: 32,
        }
    }
}

/// Generation backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9200".to_string(),
            model: "qwen2-0.5b-medical".to_string(),
            timeout_secs: 120,
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Vector store configuration. The backend is selected once at startup;
/// the pipeline only ever sees the `VectorBackend` trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String,
    pub path: Option<PathBuf>,
    pub projection_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "lance".to_string(),
            path: None,
            projection_path: None,
        }
    }
}

/// Chunking defaults applied when the caller does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub strategy: String,
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: "clinical_sections".to_string(),
            max_chunk_size: 512,
            overlap: 50,
            min_chunk_size: 20,
        }
    }
}

/// Retrieval configuration. `max_distance_default` is a cosine-distance
/// cutoff: results further than this from the query are dropped even when
/// `top_k` is not reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k_default: usize,
    pub max_distance_default: f32,
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_default: 5,
            max_distance_default: 0.7,
            timeout_secs: 10,
        }
    }
}

/// Context compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeConfig {
    pub max_length: usize,
    pub lexical_weight: f32,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            max_length: 50,
            lexical_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            log_dir: None,
        }
    }
}

/// Main configuration for medrag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vectorizer: VectorizerConfig,
    pub generation: GenerationConfig,
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub summarize: SummarizeConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from the system config directory, creating it from
    /// the embedded template on first run.
    pub fn load() -> Result<Self> {
        let config_path = crate::storage::get_system_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let template_content = include_str!("../config-templates/default.toml");
            let config: Self = toml::from_str(template_content)?;

            if let Some(parent) = config_path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&config_path, template_content)?;

            Ok(config)
        }
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the vector store path, falling back to the system data directory.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(crate::storage::get_system_storage_dir()?.join("index")),
        }
    }
}
