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

//! Search dispatch.
//!
//! One entry point fans out to the retrieval strategies by search type and
//! optionally grounds an answer over the collected context. Multi-dataset
//! requests retrieve per dataset and merge by score.

use crate::Noema;
use noema_core::{NoemaError, Result};
use noema_retrieval::{
    Citation, GraphTripletRetriever, HybridRetriever, LexicalRetriever, RetrievedItem, Retriever,
    RetrieverScope, VectorChunkRetriever,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The query modes the engine serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchType {
    /// Vector chunk retrieval plus a grounded answer.
    Rag,
    /// Graph triplet retrieval plus a grounded answer.
    GraphCompletion,
    /// All three strategies fused, plus a grounded answer.
    Hybrid,
    /// Raw chunk retrieval, no completion.
    Chunks,
    /// Conversational entry point; served by the hybrid path.
    NaturalLanguage,
}

/// Post-retrieval filters applied to the collected context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Keep only chunks originating from these source paths. Items
    /// without chunk provenance (triplets) are unaffected.
    pub source_paths: Vec<String>,
    /// Drop items scoring below this floor after ranking or fusion.
    pub min_score: Option<f32>,
}

impl SearchFilters {
    fn is_empty(&self) -> bool {
        self.source_paths.is_empty() && self.min_score.is_none()
    }

    fn apply(&self, items: &mut Vec<RetrievedItem>) {
        if self.is_empty() {
            return;
        }
        items.retain(|item| {
            if let Some(floor) = self.min_score {
                if item.score < floor {
                    return false;
                }
            }
            if !self.source_paths.is_empty() {
                if let Some(provenance) = &item.provenance {
                    let path = provenance.source_path.as_deref().unwrap_or("");
                    return self.source_paths.iter().any(|p| p == path);
                }
            }
            true
        });
    }
}

/// One search call. `session_id` is carried for conversational layers but
/// has no effect on retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub tenant_id: Uuid,
    pub datasets: Vec<Uuid>,
    pub query: String,
    pub search_type: SearchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

/// What a search returns: the answer (absent for `CHUNKS`), the ranked
/// context, citations aligned with the answer's `[n]` markers, and the
/// triplets for graph-flavored queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub context: Vec<RetrievedItem>,
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_snippet: Option<Vec<String>>,
    /// True when an optional subsystem was unavailable for this query.
    pub degraded: bool,
}

impl Noema {
    /// Execute a search across one or more datasets.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        if request.datasets.is_empty() {
            return Err(NoemaError::Validation("at least one dataset is required".into()));
        }
        if request.query.trim().is_empty() {
            return Err(NoemaError::Validation("query must not be empty".into()));
        }
        let top_k = request.top_k.unwrap_or(self.config.retrieve.top_k);
        if top_k == 0 {
            return Err(NoemaError::Validation("top_k must be positive".into()));
        }
        for &dataset_id in &request.datasets {
            self.require_dataset(request.tenant_id, dataset_id).await?;
        }

        debug!(
            search_type = ?request.search_type,
            datasets = request.datasets.len(),
            top_k,
            "dispatching search"
        );

        match request.search_type {
            SearchType::Chunks => {
                let mut context = self
                    .collect(&request, top_k, |scope| {
                        Arc::new(self.vector_retriever(scope)) as Arc<dyn Retriever>
                    })
                    .await?;
                request.filters.apply(&mut context);
                Ok(SearchResponse {
                    result: None,
                    citations: Vec::new(),
                    graph_snippet: None,
                    degraded: false,
                    context,
                })
            }
            SearchType::Rag => {
                let mut context = self
                    .collect(&request, top_k, |scope| {
                        Arc::new(self.vector_retriever(scope)) as Arc<dyn Retriever>
                    })
                    .await?;
                request.filters.apply(&mut context);
                self.answer(&request.query, context, false, None).await
            }
            SearchType::GraphCompletion => {
                let mut context = self
                    .collect(&request, top_k, |scope| {
                        Arc::new(self.graph_retriever(scope)) as Arc<dyn Retriever>
                    })
                    .await?;
                request.filters.apply(&mut context);
                let snippet: Vec<String> = context.iter().map(|i| i.text.clone()).collect();
                self.answer(&request.query, context, false, Some(snippet))
                    .await
            }
            SearchType::Hybrid | SearchType::NaturalLanguage => {
                let mut merged: Vec<RetrievedItem> = Vec::new();
                let mut degraded = false;
                for &dataset_id in &request.datasets {
                    let scope = RetrieverScope {
                        tenant_id: request.tenant_id,
                        dataset_id,
                    };
                    let hybrid = self.hybrid_retriever(scope);
                    let result = hybrid.get_context(&request.query, top_k).await?;
                    degraded |= result.degraded;
                    merged.extend(result.items);
                }
                sort_by_score(&mut merged);
                merged.truncate(top_k);
                request.filters.apply(&mut merged);
                self.answer(&request.query, merged, degraded, None).await
            }
        }
    }

    /// Run one strategy per dataset and merge the rankings.
    async fn collect<F>(
        &self,
        request: &SearchRequest,
        top_k: usize,
        make: F,
    ) -> Result<Vec<RetrievedItem>>
    where
        F: Fn(RetrieverScope) -> Arc<dyn Retriever>,
    {
        let mut merged: Vec<RetrievedItem> = Vec::new();
        for &dataset_id in &request.datasets {
            let retriever = make(RetrieverScope {
                tenant_id: request.tenant_id,
                dataset_id,
            });
            merged.extend(retriever.get_context(&request.query, top_k).await?);
        }
        sort_by_score(&mut merged);
        merged.truncate(top_k);
        Ok(merged)
    }

    async fn answer(
        &self,
        query: &str,
        context: Vec<RetrievedItem>,
        degraded: bool,
        graph_snippet: Option<Vec<String>>,
    ) -> Result<SearchResponse> {
        let generated = self.answerer.generate(query, &context).await?;
        Ok(SearchResponse {
            result: Some(generated.answer),
            citations: generated.citations,
            graph_snippet,
            degraded,
            context,
        })
    }

    fn vector_retriever(&self, scope: RetrieverScope) -> VectorChunkRetriever {
        VectorChunkRetriever::new(
            self.vectors.clone(),
            self.embedder.clone(),
            self.limiters.bucket("embedder", "embed"),
            scope,
            &self.config.retrieve,
        )
    }

    fn graph_retriever(&self, scope: RetrieverScope) -> GraphTripletRetriever {
        GraphTripletRetriever::new(
            self.graph.clone(),
            self.vectors.clone(),
            self.embedder.clone(),
            self.limiters.bucket("embedder", "embed"),
            scope,
            &self.config.retrieve,
        )
    }

    fn lexical_retriever(&self, scope: RetrieverScope) -> LexicalRetriever {
        LexicalRetriever::new(self.vectors.clone(), scope)
    }

    fn hybrid_retriever(&self, scope: RetrieverScope) -> HybridRetriever {
        HybridRetriever::new(
            Arc::new(self.vector_retriever(scope)),
            Arc::new(self.graph_retriever(scope)),
            Arc::new(self.lexical_retriever(scope)),
            &self.config.retrieve,
            self.reranker.clone(),
        )
    }
}

fn sort_by_score(items: &mut [RetrievedItem]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
