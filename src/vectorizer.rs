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

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::VectorizerConfig;
use crate::error::{Error, Result};

/// Turns content into fixed-dimension embedding vectors.
///
/// Dimensions are fixed per modality for the lifetime of the instance;
/// callers may rely on `text_dim()`/`image_dim()` matching every vector the
/// corresponding embed method returns. Batch methods must produce the same
/// vectors as the equivalent sequence of single calls.
#[async_trait]
pub trait Vectorizer: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed raw image bytes into the image embedding space.
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>>;

    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>>;

    fn text_dim(&self) -> usize;

    fn image_dim(&self) -> usize;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    inputs: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for an HTTP embedding service exposing `POST /embed/text` and
/// `POST /embed/image`. Image bytes are sent base64-encoded.
pub struct HttpVectorizer {
    client: reqwest::Client,
    endpoint: String,
    text_model: String,
    image_model: String,
    batch_size: usize,
    text_dim: usize,
    image_dim: usize,
}

impl HttpVectorizer {
    /// Create a client and probe both embedding spaces once so the
    /// per-modality dimensions are known up front.
    pub async fn connect(config: &VectorizerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::VectorizationBackend(e.to_string()))?;

        let mut vectorizer = Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
            batch_size: config.batch_size.max(1),
            text_dim: 0,
            image_dim: 0,
        };

        let probe = vectorizer.embed_text("dimension probe").await?;
        vectorizer.text_dim = probe.len();

        // An empty image model means a text-only deployment; image calls
        // will fail with UnsupportedModality. A configured model that does
        // not answer the probe is a backend error, not a downgrade.
        if config.image_enabled() {
            // A 1x1 white pixel in raw RGB; enough to learn the dimension.
            let mut vectors = vectorizer
                .post_embed("image", &vectorizer.image_model, vec![
                    base64::engine::general_purpose::STANDARD.encode([0xffu8, 0xff, 0xff]),
                ])
                .await?;
            vectorizer.image_dim = vectors.pop().map(|v| v.len()).unwrap_or(0);
        }

        Ok(vectorizer)
    }

    async fn post_embed(
        &self,
        modality_path: &str,
        model: &str,
        inputs: Vec<String>,
    ) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed/{}", self.endpoint, modality_path);
        let expected = inputs.len();

        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest { model, inputs })
            .send()
            .await
            .map_err(|e| Error::VectorizationBackend(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::VectorizationBackend(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::VectorizationBackend(format!("malformed reply: {}", e)))?;

        if body.embeddings.len() != expected {
            return Err(Error::VectorizationBackend(format!(
                "expected {} embeddings, got {}",
                expected,
                body.embeddings.len()
            )));
        }

        Ok(body.embeddings)
    }

    fn check_dim(&self, vector: &[f32], expected: usize) -> Result<()> {
        if expected != 0 && vector.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Vectorizer for HttpVectorizer {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self
            .post_embed("text", &self.text_model, vec![text.to_string()])
            .await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| Error::VectorizationBackend("empty embedding reply".to_string()))?;
        self.check_dim(&vector, self.text_dim)?;
        Ok(vector)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self
                .post_embed("text", &self.text_model, batch.to_vec())
                .await?;
            for vector in &vectors {
                self.check_dim(vector, self.text_dim)?;
            }
            all.extend(vectors);
        }
        Ok(all)
    }

    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>> {
        if self.image_dim == 0 {
            return Err(Error::UnsupportedModality(
                "no image embedding model configured".to_string(),
            ));
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let mut vectors = self
            .post_embed("image", &self.image_model, vec![encoded])
            .await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| Error::VectorizationBackend("empty embedding reply".to_string()))?;
        self.check_dim(&vector, self.image_dim)?;
        Ok(vector)
    }

    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        if self.image_dim == 0 {
            return Err(Error::UnsupportedModality(
                "no image embedding model configured".to_string(),
            ));
        }
        let mut all = Vec::with_capacity(images.len());
        for batch in images.chunks(self.batch_size) {
            let encoded: Vec<String> = batch
                .iter()
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
                .collect();
            let vectors = self.post_embed("image", &self.image_model, encoded).await?;
            for vector in &vectors {
                self.check_dim(vector, self.image_dim)?;
            }
            all.extend(vectors);
        }
        Ok(all)
    }

    fn text_dim(&self) -> usize {
        self.text_dim
    }

    fn image_dim(&self) -> usize {
        self.image_dim
    }
}


#[cfg(test)]
mod tests {
    use super::testing::HashVectorizer;
    use super::*;

    #[tokio::test]
    async fn test_batch_matches_single_calls() {
        let vectorizer = HashVectorizer::default();
        let texts = vec![
            "chest pain radiating to the left arm".to_string(),
            "persistent dry cough with low grade fever".to_string(),
        ];

        let batch = vectorizer.embed_texts(&texts).await.unwrap();
        for (text, expected) in texts.iter().zip(batch.iter()) {
            let single = vectorizer.embed_text(text).await.unwrap();
            assert_eq!(&single, expected);
        }
    }

    #[tokio::test]
    async fn test_dimensions_are_stable() {
        let vectorizer = HashVectorizer::default();
        let a = vectorizer.embed_text("first").await.unwrap();
        let b = vectorizer.embed_text("completely different input").await.unwrap();
        assert_eq!(a.len(), vectorizer.text_dim());
        assert_eq!(b.len(), vectorizer.text_dim());

        let img = vectorizer.embed_image(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(img.len(), vectorizer.image_dim());
    }
}
