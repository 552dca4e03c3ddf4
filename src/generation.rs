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
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};

/// Text generation backend.
///
/// `generate_stream` yields answer fragments in order; concatenating every
/// fragment of a successful stream gives the same answer `generate` would
/// have returned for the same prompt. Dropping the receiver cancels the
/// stream; the producer stops at the next failed send.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    async fn generate_stream(&self, prompt: &str) -> Result<mpsc::Receiver<Result<String>>>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    token: String,
    #[serde(default)]
    done: bool,
}

/// Client for an HTTP generation service exposing `POST /generate`.
/// Streaming replies arrive as newline-delimited JSON, one token per line.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: usize,
    temperature: f32,
    timeout_secs: u64,
}

impl HttpGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        // No client-level timeout: the wall-clock budget is enforced per
        // call so a healthy stream is not cut mid-flight by a socket idle.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::ModelUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }

    async fn post(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/generate", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                stream,
            })
            .send()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::ModelUnavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let budget = Duration::from_secs(self.timeout_secs);
        let call = async {
            let response = self.post(prompt, false).await?;
            let body: GenerateResponse = response
                .json()
                .await
                .map_err(|e| Error::ModelUnavailable(format!("malformed reply: {}", e)))?;
            Ok(body.text)
        };

        tokio::time::timeout(budget, call)
            .await
            .map_err(|_| Error::GenerationTimeout(self.timeout_secs))?
    }

    async fn generate_stream(&self, prompt: &str) -> Result<mpsc::Receiver<Result<String>>> {
        let budget = Duration::from_secs(self.timeout_secs);
        let deadline = tokio::time::Instant::now() + budget;
        let timeout_secs = self.timeout_secs;

        let response = tokio::time::timeout(budget, self.post(prompt, true))
            .await
            .map_err(|_| Error::GenerationTimeout(timeout_secs))??;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(pump_stream(
            response.bytes_stream(),
            tx,
            deadline,
            timeout_secs,
        ));

        Ok(rx)
    }
}

/// Forward NDJSON token lines from `bytes` into `tx` until the stream ends,
/// a `done` line arrives, the deadline passes, or the receiver is dropped.
async fn pump_stream<S, B, E>(
    mut bytes: S,
    tx: mpsc::Sender<Result<String>>,
    deadline: tokio::time::Instant,
    timeout_secs: u64,
) where
    S: futures::Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut buffer = Vec::new();

    loop {
        let chunk = match tokio::time::timeout_at(deadline, bytes.next()).await {
            Err(_) => {
                let _ = tx.send(Err(Error::GenerationTimeout(timeout_secs))).await;
                return;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(Error::ModelUnavailable(e.to_string()))).await;
                return;
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        buffer.extend_from_slice(chunk.as_ref());
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if !emit_line(&line, &tx).await {
                return;
            }
        }
    }

    // A backend may close the stream without a trailing newline; whatever
    // is left in the buffer is still the final line.
    if !buffer.is_empty() {
        let _ = emit_line(&buffer, &tx).await;
    }
}

/// Parse and forward one NDJSON line. Returns false when the stream should
/// stop, whether finished, cancelled, or malformed.
async fn emit_line(raw: &[u8], tx: &mpsc::Sender<Result<String>>) -> bool {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    match serde_json::from_str::<StreamLine>(line) {
        Ok(parsed) => {
            if !parsed.token.is_empty() && tx.send(Ok(parsed.token)).await.is_err() {
                // Receiver dropped: the caller cancelled.
                return false;
            }
            !parsed.done
        }
        Err(e) => {
            let _ = tx
                .send(Err(Error::ModelUnavailable(format!(
                    "malformed stream line: {}",
                    e
                ))))
                .await;
            false
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Collect a stream into a full answer, propagating the first error.
    pub async fn collect_stream(mut rx: mpsc::Receiver<Result<String>>) -> Result<String> {
        let mut answer = String::new();
        while let Some(fragment) = rx.recv().await {
            answer.push_str(&fragment?);
        }
        Ok(answer)
    }

    /// Deterministic generator for tests: answers with a fixed set of
    /// fragments regardless of prompt, or fails when `fail_with` is set.
    pub struct ScriptedGenerator {
        pub fragments: Vec<String>,
        pub fail_with: Option<fn() -> Error>,
    }

    impl ScriptedGenerator {
        pub fn answering(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                fail_with: None,
            }
        }

        pub fn failing(factory: fn() -> Error) -> Self {
            Self {
                fragments: Vec::new(),
                fail_with: Some(factory),
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            if let Some(factory) = self.fail_with {
                return Err(factory());
            }
            Ok(self.fragments.concat())
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<mpsc::Receiver<Result<String>>> {
            if let Some(factory) = self.fail_with {
                return Err(factory());
            }
            let (tx, rx) = mpsc::channel(8);
            let fragments = self.fragments.clone();
            tokio::spawn(async move {
                for fragment in fragments {
                    if tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }
}
