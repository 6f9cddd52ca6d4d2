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

//! Graph store port and the in-memory adjacency-list adapter.
//!
//! Nodes are typed by their `node_type` property and carry the tenant and
//! dataset envelope; edges are identified by `(source, target, type)`.
//! Writes are upserts keyed by deterministic ids, so replaying a batch is a
//! no-op.

use async_trait::async_trait;
use dashmap::DashMap;
use noema_core::{GraphEdge, GraphNode, Result};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Port over the property-graph database.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Upsert nodes. Returns how many ids were not present before
    /// (replayed batches return 0).
    async fn add_nodes(&self, nodes: &[GraphNode]) -> Result<usize>;

    /// Upsert edges by `(source, target, type)`; on conflict weight and
    /// confidence are max-merged. Returns how many identities were new.
    async fn add_edges(&self, edges: &[GraphEdge]) -> Result<usize>;

    /// All edges incident to nodes reachable from `node_id` within
    /// `depth` hops (either direction).
    async fn neighbors(&self, node_id: Uuid, depth: usize) -> Result<Vec<GraphEdge>>;

    async fn nodes_by_ids(&self, ids: &[Uuid]) -> Result<Vec<GraphNode>>;

    /// Whether a node exists. Cheap referential-integrity probe.
    async fn has_node(&self, id: Uuid) -> Result<bool>;

    /// Remove every node and edge belonging to a dataset.
    async fn delete_subgraph(&self, dataset_id: Uuid) -> Result<()>;

    async fn count_nodes(&self, dataset_id: Uuid) -> Result<usize>;
    async fn count_edges(&self, dataset_id: Uuid) -> Result<usize>;
}

type EdgeKey = (Uuid, Uuid, String);

/// In-memory reference adapter backed by concurrent adjacency lists.
#[derive(Default)]
pub struct InMemoryGraphStore {
    nodes: DashMap<Uuid, GraphNode>,
    edges: DashMap<EdgeKey, GraphEdge>,
    outgoing: DashMap<Uuid, Vec<EdgeKey>>,
    incoming: DashMap<Uuid, Vec<EdgeKey>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn incident_keys(&self, node_id: Uuid) -> Vec<EdgeKey> {
        let mut keys = Vec::new();
        if let Some(out) = self.outgoing.get(&node_id) {
            keys.extend(out.iter().cloned());
        }
        if let Some(inc) = self.incoming.get(&node_id) {
            keys.extend(inc.iter().cloned());
        }
        keys
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn add_nodes(&self, nodes: &[GraphNode]) -> Result<usize> {
        let mut inserted = 0;
        for node in nodes {
            match self.nodes.get_mut(&node.id) {
                Some(mut existing) => {
                    // Updates only land via a higher version.
                    if node.version > existing.version {
                        let created_at = existing.created_at;
                        *existing = node.clone();
                        existing.created_at = created_at;
                        inserted += 1;
                    }
                }
                None => {
                    self.nodes.insert(node.id, node.clone());
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    async fn add_edges(&self, edges: &[GraphEdge]) -> Result<usize> {
        let mut inserted = 0;
        for edge in edges {
            let key: EdgeKey = (edge.source_id, edge.target_id, edge.edge_type.clone());
            match self.edges.get_mut(&key) {
                Some(mut existing) => {
                    existing.weight = existing.weight.max(edge.weight);
                    existing.confidence = existing.confidence.max(edge.confidence);
                }
                None => {
                    self.edges.insert(key.clone(), edge.clone());
                    self.outgoing
                        .entry(edge.source_id)
                        .or_default()
                        .push(key.clone());
                    self.incoming.entry(edge.target_id).or_default().push(key);
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    async fn neighbors(&self, node_id: Uuid, depth: usize) -> Result<Vec<GraphEdge>> {
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut seen_edges: HashSet<EdgeKey> = HashSet::new();
        let mut result = Vec::new();
        let mut frontier = VecDeque::new();
        frontier.push_back((node_id, 0usize));
        visited.insert(node_id);

        while let Some((current, dist)) = frontier.pop_front() {
            if dist >= depth {
                continue;
            }
            for key in self.incident_keys(current) {
                if !seen_edges.insert(key.clone()) {
                    continue;
                }
                if let Some(edge) = self.edges.get(&key) {
                    let other = if edge.source_id == current {
                        edge.target_id
                    } else {
                        edge.source_id
                    };
                    result.push(edge.clone());
                    if visited.insert(other) {
                        frontier.push_back((other, dist + 1));
                    }
                }
            }
        }
        Ok(result)
    }

    async fn nodes_by_ids(&self, ids: &[Uuid]) -> Result<Vec<GraphNode>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| n.clone()))
            .collect())
    }

    async fn has_node(&self, id: Uuid) -> Result<bool> {
        Ok(self.nodes.contains_key(&id))
    }

    async fn delete_subgraph(&self, dataset_id: Uuid) -> Result<()> {
        let doomed: Vec<Uuid> = self
            .nodes
            .iter()
            .filter(|n| n.dataset_id == dataset_id)
            .map(|n| n.id)
            .collect();
        tracing::debug!(dataset_id = %dataset_id, nodes = doomed.len(), "deleting subgraph");
        for id in &doomed {
            self.nodes.remove(id);
            for key in self.incident_keys(*id) {
                self.edges.remove(&key);
            }
            self.outgoing.remove(id);
            self.incoming.remove(id);
        }
        Ok(())
    }

    async fn count_nodes(&self, dataset_id: Uuid) -> Result<usize> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.dataset_id == dataset_id)
            .count())
    }

    async fn count_edges(&self, dataset_id: Uuid) -> Result<usize> {
        let node_ids: HashSet<Uuid> = self
            .nodes
            .iter()
            .filter(|n| n.dataset_id == dataset_id)
            .map(|n| n.id)
            .collect();
        Ok(self
            .edges
            .iter()
            .filter(|e| node_ids.contains(&e.source_id))
            .count())
    }
}
