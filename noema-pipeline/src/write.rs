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

//! Dual-store writer.
//!
//! Collects nodes and edges from graph projections, deduplicates them,
//! writes the graph store first, then indexes every declared field of every
//! node into the vector store in rate-limited embedding batches. Each store
//! runs its own transaction; there is no cross-store coordination because
//! every write is an idempotent upsert keyed by deterministic ids.

use noema_core::{
    GraphEdge, GraphNode, GraphProjection, NoemaConfig, NoemaError, Result, RetryPolicy,
    TokenBucket,
};
use noema_storage::{collection_name, Embedder, GraphStore, VectorPoint, VectorStore};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What one write pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Nodes newly stored (replays count zero).
    pub nodes_written: u64,
    pub edges_written: u64,
    pub vectors_written: u64,
    /// In-batch duplicates folded before writing.
    pub nodes_deduped: u64,
    pub edges_deduped: u64,
    /// Edges dropped because an endpoint exists nowhere.
    pub integrity_dropped: u64,
}

impl WriteReport {
    pub fn items_written(&self) -> u64 {
        self.nodes_written + self.edges_written + self.vectors_written
    }
}

/// Writes projections to the graph and vector stores.
pub struct GraphVectorWriter {
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    embed_batch: usize,
    embed_deadline: Duration,
}

impl GraphVectorWriter {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        limiter: Arc<TokenBucket>,
        config: &NoemaConfig,
    ) -> Self {
        Self {
            graph,
            vectors,
            embedder,
            limiter,
            retry: RetryPolicy::provider_default(),
            embed_batch: config.embed.batch.max(1),
            embed_deadline: config.deadlines.embed,
        }
    }

    /// Write a batch of projections. Cancellation is honoured between
    /// embedding batches; an in-flight batch always completes so no store
    /// is left with half of an upsert group.
    pub async fn write(
        &self,
        points: &[&dyn GraphProjection],
        cancel: &CancellationToken,
    ) -> Result<WriteReport> {
        let mut report = WriteReport::default();

        // 1. Collect and deduplicate.
        let (nodes, edges) = self.collect(points, &mut report);

        // 2. Referential integrity: an edge may point at a node written in
        // an earlier run, so absence from this batch alone is not fatal.
        let node_ids: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();
        let mut valid_edges = Vec::with_capacity(edges.len());
        for edge in edges {
            if node_ids.contains(&edge.source_id) && node_ids.contains(&edge.target_id) {
                valid_edges.push(edge);
                continue;
            }
            let source_ok = node_ids.contains(&edge.source_id)
                || self.graph.has_node(edge.source_id).await?;
            let target_ok = node_ids.contains(&edge.target_id)
                || self.graph.has_node(edge.target_id).await?;
            if source_ok && target_ok {
                valid_edges.push(edge);
            } else {
                warn!(
                    source = %edge.source_id,
                    target = %edge.target_id,
                    edge_type = %edge.edge_type,
                    "dropping edge with missing endpoint"
                );
                report.integrity_dropped += 1;
            }
        }

        // 3. Nodes before edges, one transaction per store.
        report.nodes_written = self.graph.add_nodes(&nodes).await? as u64;
        report.edges_written = self.graph.add_edges(&valid_edges).await? as u64;

        // 4. Vector records for every indexed field.
        report.vectors_written = self.index_nodes(&nodes, cancel).await?;

        debug!(
            nodes = report.nodes_written,
            edges = report.edges_written,
            vectors = report.vectors_written,
            dropped = report.integrity_dropped,
            "write batch complete"
        );
        Ok(report)
    }

    fn collect(
        &self,
        points: &[&dyn GraphProjection],
        report: &mut WriteReport,
    ) -> (Vec<GraphNode>, Vec<GraphEdge>) {
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut node_slots: HashMap<Uuid, usize> = HashMap::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut edge_slots: HashMap<(Uuid, Uuid, String), usize> = HashMap::new();

        for point in points {
            for node in point.nodes() {
                match node_slots.get(&node.id).copied() {
                    Some(slot) => {
                        report.nodes_deduped += 1;
                        merge_node(&mut nodes[slot], node);
                    }
                    None => {
                        node_slots.insert(node.id, nodes.len());
                        nodes.push(node);
                    }
                }
            }
            for edge in point.edges() {
                let key = (edge.source_id, edge.target_id, edge.edge_type.clone());
                match edge_slots.get(&key).copied() {
                    Some(slot) => {
                        report.edges_deduped += 1;
                        let existing = &mut edges[slot];
                        existing.weight = existing.weight.max(edge.weight);
                        existing.confidence = existing.confidence.max(edge.confidence);
                    }
                    None => {
                        edge_slots.insert(key, edges.len());
                        edges.push(edge);
                    }
                }
            }
        }
        (nodes, edges)
    }

    /// Embed and upsert every `(node, index_field)` pair, batched.
    async fn index_nodes(&self, nodes: &[GraphNode], cancel: &CancellationToken) -> Result<u64> {
        struct Pending {
            collection: String,
            point_id: Uuid,
            text: String,
            payload: serde_json::Map<String, Value>,
        }

        let mut pending: Vec<Pending> = Vec::new();
        for node in nodes {
            for field in &node.index_fields {
                let Some(text) = node.text_property(field).filter(|t| !t.is_empty()) else {
                    continue;
                };
                let collection =
                    collection_name(node.tenant_id, node.dataset_id, &node.node_type, field);
                let mut payload = node.properties.clone();
                payload.insert("node_type".into(), node.node_type.clone().into());
                payload.insert("tenant_id".into(), node.tenant_id.to_string().into());
                payload.insert("dataset_id".into(), node.dataset_id.to_string().into());
                payload.insert("field".into(), field.clone().into());
                payload.insert("version".into(), u64::from(node.version).into());
                if let Some(chunk_id) = node.source_chunk_id {
                    payload.insert("source_chunk_id".into(), chunk_id.to_string().into());
                }
                if let Some(data_id) = node.source_data_id {
                    payload.insert("source_data_id".into(), data_id.to_string().into());
                }
                pending.push(Pending {
                    collection,
                    // The vector record shares the node's id, so either
                    // store can resolve the other's records directly.
                    point_id: node.id,
                    text: text.to_string(),
                    payload,
                });
            }
        }

        let mut written = 0u64;
        for batch in pending.chunks(self.embed_batch) {
            if cancel.is_cancelled() {
                return Err(NoemaError::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let embeddings = self
                .retry
                .run(|| {
                    let texts = texts.clone();
                    async move {
                        self.limiter.acquire().await;
                        match tokio::time::timeout(self.embed_deadline, self.embedder.embed(&texts))
                            .await
                        {
                            Ok(result) => result.map_err(NoemaError::from),
                            Err(_) => Err(NoemaError::transient("embedder deadline exceeded")),
                        }
                    }
                })
                .await?
                .value;

            let mut by_collection: HashMap<&str, Vec<VectorPoint>> = HashMap::new();
            for (item, vector) in batch.iter().zip(embeddings) {
                by_collection
                    .entry(item.collection.as_str())
                    .or_default()
                    .push(VectorPoint {
                        id: item.point_id,
                        vector,
                        payload: item.payload.clone(),
                    });
            }
            for (collection, points) in by_collection {
                written += self.vectors.upsert(collection, &points).await? as u64;
            }
        }
        Ok(written)
    }
}

/// Last write wins for scalars; aliases union as a set.
fn merge_node(existing: &mut GraphNode, incoming: GraphNode) {
    let previous_aliases = existing.properties.get("aliases").cloned();
    for (key, value) in incoming.properties {
        existing.properties.insert(key, value);
    }
    if let (Some(Value::Array(old)), Some(Value::Array(new))) = (
        previous_aliases,
        existing.properties.get_mut("aliases"),
    ) {
        for alias in old {
            if !new.contains(&alias) {
                new.push(alias);
            }
        }
    }
    existing.version = existing.version.max(incoming.version);
    for field in incoming.index_fields {
        if !existing.index_fields.contains(&field) {
            existing.index_fields.push(field);
        }
    }
}
