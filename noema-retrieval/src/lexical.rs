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

//! Lexical retrieval: BM25 over the chunk text field.
//!
//! Scores are computed in-process over chunks scrolled from the vector
//! store, so no separate full-text index has to be kept in sync with the
//! pipeline's writes.

use crate::vector::provenance_from_payload;
use crate::{sort_ranked, RetrievedItem, RetrievedKind, Retriever, RetrieverScope};
use async_trait::async_trait;
use noema_core::{NoemaError, Result, NODE_CHUNK};
use noema_storage::{collection_name, VectorStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Upper bound on chunks pulled into one scoring pass.
const SCROLL_LIMIT: usize = 10_000;

/// Classical token-overlap ranking over chunk text.
pub struct LexicalRetriever {
    vectors: Arc<dyn VectorStore>,
    scope: RetrieverScope,
}

impl LexicalRetriever {
    pub fn new(vectors: Arc<dyn VectorStore>, scope: RetrieverScope) -> Self {
        Self { vectors, scope }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Retriever for LexicalRetriever {
    fn name(&self) -> &'static str {
        "lexical"
    }

    async fn get_context(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedItem>> {
        if query.trim().is_empty() {
            return Err(NoemaError::Validation("query must not be empty".into()));
        }
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let collection = collection_name(
            self.scope.tenant_id,
            self.scope.dataset_id,
            NODE_CHUNK,
            "text",
        );
        let points = self.vectors.scroll(&collection, SCROLL_LIMIT).await?;
        if points.is_empty() {
            return Ok(Vec::new());
        }

        // Corpus statistics for one scoring pass.
        let docs: Vec<(usize, Vec<String>)> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let text = p.payload.get("text").and_then(Value::as_str).unwrap_or("");
                (i, tokenize(text))
            })
            .collect();
        let doc_count = docs.len() as f64;
        let avg_len =
            docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / doc_count.max(1.0);

        let mut document_frequency: HashMap<&str, f64> = HashMap::new();
        for term in &query_terms {
            let df = docs
                .iter()
                .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
                .count() as f64;
            document_frequency.insert(term.as_str(), df);
        }

        let mut items: Vec<RetrievedItem> = Vec::new();
        for (index, tokens) in &docs {
            let doc_len = tokens.len() as f64;
            let mut score = 0.0f64;
            for term in &query_terms {
                let tf = tokens.iter().filter(|t| *t == term).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let df = document_frequency[term.as_str()];
                let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
                let norm = tf * (BM25_K1 + 1.0)
                    / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len.max(1.0)));
                score += idf * norm;
            }
            if score <= 0.0 {
                continue;
            }
            let point = &points[*index];
            items.push(RetrievedItem {
                id: point.id,
                kind: RetrievedKind::Chunk,
                text: point
                    .payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: score as f32,
                provenance: Some(provenance_from_payload(point.id, &point.payload)),
            });
        }

        sort_ranked(&mut items);
        items.truncate(top_k);
        debug!(corpus = docs.len(), hits = items.len(), "lexical retrieval complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_storage::{InMemoryVectorStore, VectorPoint};
    use serde_json::{json, Map};
    use uuid::Uuid;

    async fn seeded(texts: &[&str]) -> (LexicalRetriever, Vec<Uuid>) {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let scope = RetrieverScope {
            tenant_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
        };
        let collection = collection_name(scope.tenant_id, scope.dataset_id, NODE_CHUNK, "text");

        let mut ids = Vec::new();
        for text in texts {
            let id = Uuid::new_v4();
            let mut payload = Map::new();
            payload.insert("text".into(), json!(text));
            payload.insert("version".into(), json!(1));
            vectors
                .upsert(
                    &collection,
                    &[VectorPoint {
                        id,
                        vector: vec![0.0; 8],
                        payload,
                    }],
                )
                .await
                .unwrap();
            ids.push(id);
        }
        (LexicalRetriever::new(vectors, scope), ids)
    }

    #[tokio::test]
    async fn ranks_term_matches_above_nonmatches() {
        let (retriever, ids) = seeded(&[
            "The reactor core overheated during the test.",
            "Lunch menus are posted on Fridays.",
            "Routine reactor maintenance was scheduled.",
        ])
        .await;

        let items = retriever.get_context("reactor overheated", 10).await.unwrap();
        assert_eq!(items.len(), 2);
        // The chunk containing both terms ranks first.
        assert_eq!(items[0].id, ids[0]);
        assert!(!items.iter().any(|i| i.id == ids[1]));
    }

    #[tokio::test]
    async fn rare_terms_outweigh_common_ones() {
        let (retriever, ids) = seeded(&[
            "the system processes the data in the queue",
            "the system halted with a segfault",
            "the system processes requests",
        ])
        .await;

        let items = retriever.get_context("system segfault", 10).await.unwrap();
        assert_eq!(items[0].id, ids[1]);
    }

    #[tokio::test]
    async fn empty_corpus_returns_nothing() {
        let (retriever, _) = seeded(&[]).await;
        assert!(retriever.get_context("anything", 5).await.unwrap().is_empty());
    }
}
