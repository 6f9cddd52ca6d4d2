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

//! The data-point model: anything that is written to both the graph and the
//! vector store.
//!
//! Domain types implement [`GraphProjection`] to describe themselves as
//! property-graph nodes and edges. Each node declares which of its scalar
//! fields get embedded (`index_fields`), so the writer needs no reflection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Node type for canonical entities.
pub const NODE_ENTITY: &str = "Entity";
/// Node type for document chunks.
pub const NODE_CHUNK: &str = "DocumentChunk";
/// Node type for distilled cross-chunk knowledge.
pub const NODE_DISTILLATION: &str = "Distillation";
/// Edge type linking a chunk to an entity it mentions.
pub const EDGE_MENTIONS: &str = "mentions";

/// Exact source location of a derived artifact, attached for citations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub data_id: Uuid,
    pub chunk_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    pub start_line: usize,
    pub end_line: usize,
    pub start_char: usize,
    pub end_char: usize,
}

/// A property-graph node as stored. Scalar attributes live in `properties`;
/// the envelope fields are always present so every query can scope by
/// tenant and dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub node_type: String,
    pub tenant_id: Uuid,
    pub dataset_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_data_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_chunk_id: Option<Uuid>,
    pub version: u32,
    pub properties: Map<String, Value>,
    /// Field names whose values get a vector record.
    pub index_fields: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphNode {
    pub fn new(id: Uuid, node_type: impl Into<String>, tenant_id: Uuid, dataset_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_type: node_type.into(),
            tenant_id,
            dataset_id,
            source_data_id: None,
            source_chunk_id: None,
            version: 1,
            properties: Map::new(),
            index_fields: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_index_fields(mut self, fields: &[&str]) -> Self {
        self.index_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_source(mut self, data_id: Uuid, chunk_id: Option<Uuid>) -> Self {
        self.source_data_id = Some(data_id);
        self.source_chunk_id = chunk_id;
        self
    }

    /// String value of a property, if present and textual.
    pub fn text_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// A directed typed edge between two nodes. Identity is
/// `(source_id, target_id, edge_type)`; duplicate writes merge weights and
/// confidences by maximum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub edge_type: String,
    pub weight: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_chunk_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
}

impl GraphEdge {
    pub fn new(source_id: Uuid, target_id: Uuid, edge_type: impl Into<String>) -> Self {
        Self {
            source_id,
            target_id,
            edge_type: edge_type.into(),
            weight: 1.0,
            confidence: 1.0,
            source_chunk_id: None,
            properties: Map::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_source_chunk(mut self, chunk_id: Uuid) -> Self {
        self.source_chunk_id = Some(chunk_id);
        self
    }

    /// Dedup key for this edge.
    pub fn identity(&self) -> (Uuid, Uuid, &str) {
        (self.source_id, self.target_id, self.edge_type.as_str())
    }
}

/// Implemented by every domain type that materializes into the stores.
/// Replaces runtime reflection with an explicit projection.
pub trait GraphProjection: Send + Sync {
    /// The nodes this value contributes.
    fn nodes(&self) -> Vec<GraphNode>;

    /// The edges this value contributes. Endpoints may belong to other
    /// data points in the same batch; the writer checks integrity.
    fn edges(&self) -> Vec<GraphEdge>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_builder_sets_envelope() {
        let tenant = Uuid::new_v4();
        let dataset = Uuid::new_v4();
        let node = GraphNode::new(Uuid::new_v4(), NODE_ENTITY, tenant, dataset)
            .with_property("name", "acme")
            .with_index_fields(&["name", "description"]);

        assert_eq!(node.node_type, NODE_ENTITY);
        assert_eq!(node.text_property("name"), Some("acme"));
        assert_eq!(node.index_fields, vec!["name", "description"]);
        assert_eq!(node.version, 1);
    }

    #[test]
    fn edge_identity_ignores_scores() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let e1 = GraphEdge::new(a, b, "works_at").with_confidence(0.9);
        let e2 = GraphEdge::new(a, b, "works_at").with_confidence(0.4);
        assert_eq!(e1.identity(), e2.identity());
    }

    #[test]
    fn confidence_is_clamped() {
        let e = GraphEdge::new(Uuid::new_v4(), Uuid::new_v4(), "t").with_confidence(1.7);
        assert_eq!(e.confidence, 1.0);
    }
}
