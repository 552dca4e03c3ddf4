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

use thiserror::Error;

/// Errors raised by the RAG pipeline and its components.
///
/// The taxonomy keeps "nothing relevant found" (an empty, successful result)
/// distinguishable from "the system could not search" (a backend error).
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before it reaches the pipeline state machine.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Content kind the vectorizer does not recognize.
    #[error("unsupported modality: {0}")]
    UnsupportedModality(String),

    /// Cross-modal search attempted without a registered projection
    /// between the two embedding spaces.
    #[error("incompatible modalities: {0}")]
    IncompatibleModality(String),

    /// A vector violated the fixed-dimension contract for its modality.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding backend is unreachable or returned a malformed reply.
    #[error("vectorization backend error: {0}")]
    VectorizationBackend(String),

    /// The vector store could not serve the request.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    /// Generation exceeded its wall-clock budget.
    #[error("generation timed out after {0}s")]
    GenerationTimeout(u64),

    /// The generation backend cannot be reached.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Configuration validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Dependency errors during the retrieval stage degrade to an
    /// ungrounded answer; everything else is fatal to the query.
    pub fn is_retrieval_degradable(&self) -> bool {
        matches!(
            self,
            Error::VectorizationBackend(_) | Error::StoreUnavailable(_)
        )
    }
}
