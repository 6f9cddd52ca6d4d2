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

//! Vector chunk retrieval: embed the query, search the chunk collection,
//! filter by similarity. Query embeddings are cached briefly since users
//! iterate on the same question.

use crate::{sort_ranked, RetrievedItem, RetrievedKind, Retriever, RetrieverScope};
use async_trait::async_trait;
use moka::sync::Cache;
use noema_core::{NoemaError, Provenance, Result, RetrieveConfig, TokenBucket, NODE_CHUNK};
use noema_storage::{collection_name, Embedder, VectorStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Retrieves chunks by cosine similarity to the query embedding.
pub struct VectorChunkRetriever {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    limiter: Arc<TokenBucket>,
    scope: RetrieverScope,
    similarity_threshold: f32,
    query_cache: Cache<String, Vec<f32>>,
}

impl VectorChunkRetriever {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        limiter: Arc<TokenBucket>,
        scope: RetrieverScope,
        config: &RetrieveConfig,
    ) -> Self {
        Self {
            vectors,
            embedder,
            limiter,
            scope,
            similarity_threshold: config.similarity_threshold,
            query_cache: Cache::builder()
                .max_capacity(1000)
                .time_to_live(Duration::from_secs(300))
                .build(),
        }
    }

    pub(crate) async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let cache_key = query.trim().to_lowercase();
        if let Some(cached) = self.query_cache.get(&cache_key) {
            return Ok(cached);
        }
        self.limiter.acquire().await;
        let mut vectors = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(NoemaError::from)?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| NoemaError::transient("embedder returned no vector"))?;
        self.query_cache.insert(cache_key, embedding.clone());
        Ok(embedding)
    }
}

/// Pull citation fields out of a stored chunk payload.
pub(crate) fn provenance_from_payload(id: Uuid, payload: &Map<String, Value>) -> Provenance {
    let uuid_field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_default()
    };
    let usize_field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or_default() as usize
    };
    Provenance {
        data_id: uuid_field("source_data_id"),
        chunk_id: id,
        source_path: payload
            .get("source_path")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        page_number: payload
            .get("page_number")
            .and_then(Value::as_u64)
            .map(|p| p as u32),
        start_line: usize_field("start_line"),
        end_line: usize_field("end_line"),
        start_char: usize_field("start_char"),
        end_char: usize_field("end_char"),
    }
}

#[async_trait]
impl Retriever for VectorChunkRetriever {
    fn name(&self) -> &'static str {
        "vector"
    }

    async fn get_context(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedItem>> {
        if query.trim().is_empty() {
            return Err(NoemaError::Validation("query must not be empty".into()));
        }
        let embedding = self.embed_query(query).await?;
        let collection = collection_name(
            self.scope.tenant_id,
            self.scope.dataset_id,
            NODE_CHUNK,
            "text",
        );
        let hits = self.vectors.search(&collection, &embedding, top_k).await?;

        let mut items: Vec<RetrievedItem> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.similarity_threshold)
            .map(|hit| RetrievedItem {
                id: hit.id,
                kind: RetrievedKind::Chunk,
                text: hit
                    .payload
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score: hit.score,
                provenance: Some(provenance_from_payload(hit.id, &hit.payload)),
            })
            .collect();
        sort_ranked(&mut items);
        debug!(query_len = query.len(), hits = items.len(), "vector retrieval complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_core::LimiterConfig;
    use noema_storage::{HashEmbedder, InMemoryVectorStore, VectorPoint};
    use serde_json::json;

    async fn seeded() -> (VectorChunkRetriever, Uuid) {
        let vectors = Arc::new(InMemoryVectorStore::new());
        let embedder = Arc::new(HashEmbedder::new(64));
        let scope = RetrieverScope {
            tenant_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
        };
        let collection = collection_name(scope.tenant_id, scope.dataset_id, NODE_CHUNK, "text");

        // Store a chunk embedded from its own text; querying with the same
        // text scores 1.0 under the deterministic test embedder.
        let chunk_id = Uuid::new_v4();
        let text = "Alice works at Acme.";
        let embedding = noema_storage::deterministic_embedding(text, 64);
        let mut payload = Map::new();
        payload.insert("text".into(), json!(text));
        payload.insert("start_line".into(), json!(1));
        payload.insert("end_line".into(), json!(1));
        payload.insert("version".into(), json!(1));
        vectors
            .upsert(
                &collection,
                &[VectorPoint {
                    id: chunk_id,
                    vector: embedding,
                    payload,
                }],
            )
            .await
            .unwrap();

        let retriever = VectorChunkRetriever::new(
            vectors,
            embedder,
            Arc::new(TokenBucket::new(LimiterConfig::default())),
            scope,
            &RetrieveConfig::default(),
        );
        (retriever, chunk_id)
    }

    #[tokio::test]
    async fn exact_text_match_retrieves_the_chunk() {
        let (retriever, chunk_id) = seeded().await;
        let items = retriever
            .get_context("Alice works at Acme.", 5)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, chunk_id);
        assert!(items[0].score > 0.99);
        assert_eq!(items[0].kind, RetrievedKind::Chunk);
        assert!(items[0].provenance.is_some());
    }

    #[tokio::test]
    async fn dissimilar_queries_fall_below_threshold() {
        let (retriever, _) = seeded().await;
        let items = retriever
            .get_context("completely unrelated question", 5)
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (retriever, _) = seeded().await;
        let err = retriever.get_context("   ", 5).await.unwrap_err();
        assert!(matches!(err, NoemaError::Validation(_)));
    }
}
