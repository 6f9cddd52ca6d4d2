// Copyright 2025 Noema (https://github.com/noema-ai)
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

//! Cross-encoder rerank port.
//!
//! A rerank backend scores `(query, text)` pairs jointly, which is more
//! accurate than the bi-encoder similarity used for first-stage retrieval.
//! The backend is optional: when it is missing or failing, fused ordering
//! stands and reranking is skipped silently.

use async_trait::async_trait;
use noema_storage::CompletionError;

/// Port over a cross-encoder rerank model.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Relevance score per text against the query; higher is better.
    /// Must return exactly one score per input text.
    async fn score(
        &self,
        query: &str,
        texts: &[String],
    ) -> std::result::Result<Vec<f32>, CompletionError>;
}
