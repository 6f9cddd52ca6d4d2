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

//! Noema Retrieval
//!
//! Three retrieval strategies over one dataset's artifacts (vector chunk
//! similarity, graph triplet traversal, lexical ranking) plus hybrid
//! reciprocal-rank fusion with an optional cross-encoder rerank, and the
//! grounded answer generator.

pub mod answer;
pub mod graph;
pub mod hybrid;
pub mod lexical;
pub mod rerank;
pub mod vector;

use async_trait::async_trait;
use noema_core::{Provenance, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use answer::{AnswerGenerator, Citation, GeneratedAnswer, NO_CONTEXT_ANSWER};
pub use graph::GraphTripletRetriever;
pub use hybrid::{reciprocal_rank_fusion, HybridResult, HybridRetriever, RankedList};
pub use lexical::LexicalRetriever;
pub use rerank::Reranker;
pub use vector::VectorChunkRetriever;

/// What kind of artifact a retrieved item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievedKind {
    Chunk,
    Triplet,
    Distillation,
}

/// One ranked result from any strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub id: Uuid,
    pub kind: RetrievedKind,
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// The tenant/dataset scope a retriever reads from. Every lookup carries
/// the tenant; there are no cross-tenant reads.
#[derive(Debug, Clone, Copy)]
pub struct RetrieverScope {
    pub tenant_id: Uuid,
    pub dataset_id: Uuid,
}

/// A retrieval strategy.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &'static str;

    /// Top-k context items for a query, best first.
    async fn get_context(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedItem>>;
}

/// Stable ordering shared by every strategy: score descending, id
/// ascending on ties.
pub(crate) fn sort_ranked(items: &mut [RetrievedItem]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
