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

//! Hybrid retrieval: run the three strategies concurrently and fuse their
//! rankings with weighted reciprocal rank fusion. A failing strategy
//! contributes an empty list and flags the result degraded; the whole call
//! only fails when both stores-backed strategies are down.

use crate::rerank::Reranker;
use crate::{RetrievedItem, Retriever};
use futures::join;
use noema_core::{HybridWeights, NoemaError, Result, RetrieveConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One strategy's ranked output plus its fusion weight and tie-break
/// priority (lower wins ties).
pub struct RankedList {
    pub weight: f64,
    pub priority: usize,
    pub items: Vec<RetrievedItem>,
}

/// Weighted reciprocal rank fusion with 1-based ranks:
/// `fused(id) = Σ weight_i / (k + rank_i(id))`, absent lists contribute
/// nothing. Ties break by strategy priority, then id.
pub fn reciprocal_rank_fusion(lists: &[RankedList], k: u32) -> Vec<RetrievedItem> {
    struct Fused {
        item: RetrievedItem,
        score: f64,
        priority: usize,
    }

    let mut fused: HashMap<Uuid, Fused> = HashMap::new();
    for list in lists {
        for (rank0, item) in list.items.iter().enumerate() {
            let contribution = list.weight / (k as f64 + rank0 as f64 + 1.0);
            match fused.entry(item.id) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.score += contribution;
                    if list.priority < entry.priority {
                        entry.priority = list.priority;
                        entry.item = item.clone();
                    }
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(Fused {
                        item: item.clone(),
                        score: contribution,
                        priority: list.priority,
                    });
                }
            }
        }
    }

    let mut entries: Vec<Fused> = fused.into_values().collect();
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.item.id.cmp(&b.item.id))
    });
    entries
        .into_iter()
        .map(|mut e| {
            e.item.score = e.score as f32;
            e.item
        })
        .collect()
}

/// Hybrid result with the degradation marker.
#[derive(Debug)]
pub struct HybridResult {
    pub items: Vec<RetrievedItem>,
    /// True when at least one strategy failed and was skipped.
    pub degraded: bool,
}

/// Fuses the vector, graph and lexical strategies.
pub struct HybridRetriever {
    vector: Arc<dyn Retriever>,
    graph: Arc<dyn Retriever>,
    lexical: Arc<dyn Retriever>,
    weights: HybridWeights,
    rrf_k: u32,
    rerank_enabled: bool,
    reranker: Option<Arc<dyn Reranker>>,
}

impl HybridRetriever {
    pub fn new(
        vector: Arc<dyn Retriever>,
        graph: Arc<dyn Retriever>,
        lexical: Arc<dyn Retriever>,
        config: &RetrieveConfig,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            vector,
            graph,
            lexical,
            weights: config.weights.normalized(),
            rrf_k: config.rrf_k,
            rerank_enabled: config.rerank_enabled,
            reranker,
        }
    }

    /// Run all three strategies with the same `top_k` and fuse.
    pub async fn get_context(&self, query: &str, top_k: usize) -> Result<HybridResult> {
        let (vector, graph, lexical) = join!(
            self.safe(&self.vector, query, top_k),
            self.safe(&self.graph, query, top_k),
            self.safe(&self.lexical, query, top_k),
        );

        // Both store-backed strategies down means there is nothing left to
        // serve from.
        if vector.is_none() && graph.is_none() {
            return Err(NoemaError::transient(
                "vector and graph retrieval both unavailable",
            ));
        }
        let degraded = vector.is_none() || graph.is_none() || lexical.is_none();

        let lists = [
            RankedList {
                weight: self.weights.vector,
                priority: 0,
                items: vector.unwrap_or_default(),
            },
            RankedList {
                weight: self.weights.graph,
                priority: 1,
                items: graph.unwrap_or_default(),
            },
            RankedList {
                weight: self.weights.lexical,
                priority: 2,
                items: lexical.unwrap_or_default(),
            },
        ];
        let mut fused = reciprocal_rank_fusion(&lists, self.rrf_k);

        if self.rerank_enabled {
            if let Some(reranker) = &self.reranker {
                fused.truncate(3 * top_k);
                fused = self.rerank(reranker, query, fused).await;
            }
        }

        fused.truncate(top_k);
        debug!(results = fused.len(), degraded, "hybrid retrieval complete");
        Ok(HybridResult {
            items: fused,
            degraded,
        })
    }

    async fn safe(
        &self,
        retriever: &Arc<dyn Retriever>,
        query: &str,
        top_k: usize,
    ) -> Option<Vec<RetrievedItem>> {
        match retriever.get_context(query, top_k).await {
            Ok(items) => Some(items),
            Err(e) => {
                warn!(strategy = retriever.name(), error = %e, "retrieval strategy failed");
                None
            }
        }
    }

    /// Reorder by cross-encoder scores; on any backend problem the fused
    /// order stands.
    async fn rerank(
        &self,
        reranker: &Arc<dyn Reranker>,
        query: &str,
        items: Vec<RetrievedItem>,
    ) -> Vec<RetrievedItem> {
        let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
        match reranker.score(query, &texts).await {
            Ok(scores) if scores.len() == items.len() => {
                let mut scored: Vec<(f32, RetrievedItem)> =
                    scores.into_iter().zip(items).collect();
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.id.cmp(&b.1.id))
                });
                scored
                    .into_iter()
                    .map(|(score, mut item)| {
                        item.score = score;
                        item
                    })
                    .collect()
            }
            Ok(_) => {
                warn!("reranker returned a mismatched score count, keeping fused order");
                items
            }
            Err(e) => {
                warn!(error = %e, "rerank backend unavailable, keeping fused order");
                items
            }
        }
    }
}
