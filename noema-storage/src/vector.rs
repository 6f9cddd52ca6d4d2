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

//! Vector store port and the brute-force in-memory adapter.
//!
//! Collections are named `{tenant}_{dataset}_{type}_{field}` (ASCII-safe,
//! length-capped). Points are upserts keyed by deterministic id and only
//! replaced by a higher `version` in the payload.

use async_trait::async_trait;
use dashmap::DashMap;
use noema_core::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Longest collection name emitted; longer names get a hash suffix.
const MAX_COLLECTION_NAME: usize = 96;

/// A stored vector with its payload.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

impl VectorPoint {
    pub fn version(&self) -> u64 {
        self.payload
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// Payload-equality filter for deletes.
#[derive(Debug, Clone)]
pub struct PayloadFilter {
    pub key: String,
    pub value: Value,
}

impl PayloadFilter {
    pub fn dataset(dataset_id: Uuid) -> Self {
        Self {
            key: "dataset_id".to_string(),
            value: Value::String(dataset_id.to_string()),
        }
    }
}

/// Build the canonical collection name for one indexed field of one node
/// type. ASCII-safe and capped; the cap keeps names valid for every vector
/// backend we target.
pub fn collection_name(tenant_id: Uuid, dataset_id: Uuid, node_type: &str, field: &str) -> String {
    let raw = format!(
        "{}_{}_{}_{}",
        tenant_id.simple(),
        dataset_id.simple(),
        node_type,
        field
    );
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.len() <= MAX_COLLECTION_NAME {
        return sanitized;
    }
    let digest = blake3_short(&sanitized);
    format!("{}_{}", &sanitized[..MAX_COLLECTION_NAME - 17], digest)
}

fn blake3_short(input: &str) -> String {
    // 8 hex bytes is plenty to disambiguate truncated names.
    let hash = blake3::hash(input.as_bytes());
    hash.to_hex().as_str()[..16].to_string()
}

/// Port over the vector database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upsert points into a collection (created on first write). Returns
    /// how many points were actually stored; a point whose id exists with
    /// an equal or newer version is skipped.
    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<usize>;

    /// Top-k nearest points by cosine similarity, ordered by
    /// `(score desc, id asc)` so equal scores rank deterministically.
    async fn search(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>>;

    /// Page through a collection without a query vector.
    async fn scroll(&self, collection: &str, limit: usize) -> Result<Vec<VectorPoint>>;

    async fn delete_by_filter(&self, collection: &str, filter: &PayloadFilter) -> Result<u64>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Brute-force cosine adapter for tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: DashMap<String, Arc<DashMap<Uuid, VectorPoint>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<usize> {
        let coll = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .clone();
        let mut written = 0;
        for point in points {
            // Read the current version and release the shard lock before
            // inserting.
            let stale = coll
                .get(&point.id)
                .map(|existing| existing.version() >= point.version())
                .unwrap_or(false);
            if !stale {
                coll.insert(point.id, point.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn search(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>> {
        let Some(coll) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ScoredPoint> = coll
            .iter()
            .map(|p| ScoredPoint {
                id: p.id,
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn scroll(&self, collection: &str, limit: usize) -> Result<Vec<VectorPoint>> {
        let Some(coll) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut points: Vec<VectorPoint> = coll.iter().map(|p| p.clone()).collect();
        points.sort_by_key(|p| p.id);
        points.truncate(limit);
        Ok(points)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &PayloadFilter) -> Result<u64> {
        let Some(coll) = self.collections.get(collection) else {
            return Ok(0);
        };
        let doomed: Vec<Uuid> = coll
            .iter()
            .filter(|p| p.payload.get(&filter.key) == Some(&filter.value))
            .map(|p| p.id)
            .collect();
        for id in &doomed {
            coll.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.iter().map(|c| c.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0))
    }
}

/// Cosine similarity; zero for mismatched or degenerate vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a < 1e-8 || norm_b < 1e-8 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
