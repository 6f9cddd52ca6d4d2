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

//! LLM graph extraction.
//!
//! One structured-output call per chunk produces typed entities and
//! relations. Calls run at temperature zero against a strict JSON schema;
//! malformed responses get a bounded re-ask, transient provider failures go
//! through the shared retry policy, and every call waits on the provider's
//! token bucket first.

use crate::chunk::DocumentChunk;
use crate::prompts::{declared_entity_types, extraction_prompt, schema_repair_suffix};
use crate::resolve::normalize_name;
use noema_core::{
    GraphEdge, GraphNode, GraphProjection, NoemaConfig, NoemaError, Result, RetryPolicy,
    TokenBucket, EDGE_MENTIONS, NODE_ENTITY,
};
use noema_storage::{CompletionError, CompletionRequest, LanguageModel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A canonical (or not-yet-resolved) entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub dataset_id: Uuid,
    /// Display name, as first seen in text.
    pub name: String,
    pub normalized_name: String,
    pub entity_type: String,
    pub description: String,
    pub aliases: Vec<String>,
    pub source_chunks: Vec<Uuid>,
    pub confidence: f64,
}

impl GraphProjection for Entity {
    fn nodes(&self) -> Vec<GraphNode> {
        let mut node = GraphNode::new(self.id, NODE_ENTITY, self.tenant_id, self.dataset_id)
            .with_property("name", self.name.clone())
            .with_property("normalized_name", self.normalized_name.clone())
            .with_property("entity_type", self.entity_type.clone())
            .with_property("description", self.description.clone())
            .with_property("aliases", json!(self.aliases))
            .with_property("confidence", self.confidence)
            .with_index_fields(&["name", "description"]);
        node.source_chunk_id = self.source_chunks.first().copied();
        vec![node]
    }

    fn edges(&self) -> Vec<GraphEdge> {
        self.source_chunks
            .iter()
            .map(|chunk_id| GraphEdge::new(*chunk_id, self.id, EDGE_MENTIONS))
            .collect()
    }
}

/// A directed relation between two extracted entities. Endpoint names are
/// kept for prompts and triplet rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub source_name: String,
    pub target_name: String,
    pub relation_type: String,
    pub weight: f64,
    pub confidence: f64,
    pub source_chunk_id: Uuid,
}

impl Relation {
    pub fn to_graph_edge(&self) -> GraphEdge {
        let mut edge = GraphEdge::new(self.source_id, self.target_id, self.relation_type.clone())
            .with_weight(self.weight)
            .with_confidence(self.confidence)
            .with_source_chunk(self.source_chunk_id);
        edge.properties
            .insert("source_name".into(), self.source_name.clone().into());
        edge.properties
            .insert("target_name".into(), self.target_name.clone().into());
        edge
    }
}

/// What extraction yields for one chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkGraph {
    pub chunk_id: Uuid,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    /// True when the model found nothing in the chunk; not a failure.
    pub low_yield: bool,
    /// Edges dropped because an endpoint was not in the node set.
    pub dangling_dropped: u64,
    /// Relations dropped for using a predicate outside the ontology.
    pub ontology_dropped: u64,
    /// Transient retries spent on this chunk.
    pub retries: u64,
}

#[derive(Debug, Deserialize)]
struct WireGraph {
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(default)]
    edges: Vec<WireEdge>,
}

#[derive(Debug, Deserialize)]
struct WireNode {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct WireEdge {
    source: String,
    target: String,
    relation: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.8
}

/// JSON schema the provider enforces on extraction responses.
pub fn knowledge_graph_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "nodes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string"},
                        "description": {"type": "string"},
                        "aliases": {"type": "array", "items": {"type": "string"}},
                        "confidence": {"type": "number"}
                    },
                    "required": ["name", "type"]
                }
            },
            "edges": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "target": {"type": "string"},
                        "relation": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["source", "target", "relation"]
                }
            }
        },
        "required": ["nodes", "edges"]
    })
}

/// Per-chunk graph extractor.
pub struct GraphExtractor {
    llm: Arc<dyn LanguageModel>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    model: String,
    temperature: f32,
    max_parse_retries: u32,
    deadline: Duration,
    /// Entity types offered to the model: the ontology whitelist when one
    /// is enabled, the declared defaults otherwise.
    entity_types: Vec<String>,
    /// Normalized predicate whitelist; `None` means unconstrained.
    relation_whitelist: Option<HashSet<String>>,
}

impl GraphExtractor {
    pub fn new(llm: Arc<dyn LanguageModel>, limiter: Arc<TokenBucket>, config: &NoemaConfig) -> Self {
        let entity_types = config
            .ontology
            .allowed_entity_types()
            .map(|types| types.into_iter().map(str::to_string).collect())
            .unwrap_or_else(declared_entity_types);
        let relation_whitelist = config
            .ontology
            .allowed_relation_types()
            .map(|types| types.into_iter().map(canonical_relation).collect());
        Self {
            llm,
            limiter,
            retry: RetryPolicy::with_max_attempts(config.extractor.max_retries),
            model: config.extractor.model.clone(),
            temperature: config.extractor.temperature,
            max_parse_retries: config.extractor.max_parse_retries,
            deadline: config.deadlines.llm,
            entity_types,
            relation_whitelist,
        }
    }

    /// Extract a typed graph from one chunk.
    ///
    /// Transient failures retry with backoff; schema violations re-ask up
    /// to the parse budget and then fail permanently; cancellation aborts
    /// between provider calls.
    pub async fn extract(
        &self,
        chunk: &DocumentChunk,
        cancel: &CancellationToken,
    ) -> Result<ChunkGraph> {
        let schema = knowledge_graph_schema();
        let mut prompt = extraction_prompt(&chunk.text, &self.entity_types);
        let mut parse_attempts = 0u32;
        let mut total_retries = 0u64;

        let wire = loop {
            if cancel.is_cancelled() {
                return Err(NoemaError::Cancelled);
            }
            let request = CompletionRequest::structured(
                self.model.clone(),
                prompt.clone(),
                schema.clone(),
                self.temperature,
                self.deadline,
            );

            let retried = tokio::select! {
                _ = cancel.cancelled() => return Err(NoemaError::Cancelled),
                outcome = self.retry.run(|| {
                    let request = request.clone();
                    async move {
                        self.limiter.acquire().await;
                        match self.llm.structured_complete(&request).await {
                            Ok(value) => Ok(Ok(value)),
                            // Schema problems are handled by the re-ask
                            // loop, not the transient retry policy.
                            Err(CompletionError::SchemaViolation(e)) => Ok(Err(e)),
                            Err(other) => Err(NoemaError::from(other)),
                        }
                    }
                }) => outcome?,
            };
            total_retries += retried.retries as u64;

            let schema_error = match retried.value {
                Ok(value) => match serde_json::from_value::<WireGraph>(value) {
                    Ok(wire) => break wire,
                    Err(e) => e.to_string(),
                },
                Err(provider_schema_error) => provider_schema_error,
            };

            parse_attempts += 1;
            if parse_attempts > self.max_parse_retries {
                return Err(NoemaError::permanent(format!(
                    "extraction response for chunk {} failed schema validation after {} attempts: {}",
                    chunk.id, parse_attempts, schema_error
                )));
            }
            debug!(chunk_id = %chunk.id, attempt = parse_attempts, error = %schema_error, "re-asking after schema violation");
            prompt.push_str(&schema_repair_suffix(&schema_error));
        };

        let mut graph = self.assemble(chunk, wire);
        graph.retries = total_retries;
        Ok(graph)
    }

    /// Turn the wire response into domain entities and relations with
    /// deterministic ids, dropping what cannot be kept.
    fn assemble(&self, chunk: &DocumentChunk, wire: WireGraph) -> ChunkGraph {
        let mut entities: Vec<Entity> = Vec::new();
        let mut by_key: HashMap<Uuid, usize> = HashMap::new();
        // Every surface form (name or alias) to the entity it belongs to.
        let mut surface_to_id: HashMap<String, (Uuid, String)> = HashMap::new();

        for node in wire.nodes {
            let normalized = normalize_name(&node.name);
            if normalized.is_empty() {
                continue;
            }
            let entity_type = match canonical_type(&node.entity_type, &self.entity_types) {
                Some(canonical) => canonical,
                None => {
                    warn!(given = %node.entity_type, name = %node.name, "unknown entity type rewritten to Other");
                    "Other".to_string()
                }
            };

            let id = noema_core::id::entity_id(chunk.tenant_id, &normalized, &entity_type);
            surface_to_id.insert(normalized.clone(), (id, node.name.clone()));
            for alias in &node.aliases {
                let alias_norm = normalize_name(alias);
                if !alias_norm.is_empty() {
                    surface_to_id
                        .entry(alias_norm)
                        .or_insert((id, node.name.clone()));
                }
            }

            match by_key.get(&id).copied() {
                Some(slot) => {
                    let existing = &mut entities[slot];
                    if node.confidence > existing.confidence {
                        existing.confidence = node.confidence.clamp(0.0, 1.0);
                    }
                    if existing.description.is_empty() && !node.description.is_empty() {
                        existing.description = node.description;
                    }
                    for alias in node.aliases {
                        if !existing.aliases.contains(&alias) {
                            existing.aliases.push(alias);
                        }
                    }
                }
                None => {
                    by_key.insert(id, entities.len());
                    entities.push(Entity {
                        id,
                        tenant_id: chunk.tenant_id,
                        dataset_id: chunk.dataset_id,
                        name: node.name,
                        normalized_name: normalized,
                        entity_type,
                        description: node.description,
                        aliases: node.aliases,
                        source_chunks: vec![chunk.id],
                        confidence: node.confidence.clamp(0.0, 1.0),
                    });
                }
            }
        }

        let mut relations: Vec<Relation> = Vec::new();
        let mut seen: HashMap<(Uuid, Uuid, String), usize> = HashMap::new();
        let mut dangling = 0u64;
        let mut off_ontology = 0u64;
        for edge in wire.edges {
            let source = surface_to_id.get(&normalize_name(&edge.source));
            let target = surface_to_id.get(&normalize_name(&edge.target));
            let (Some((source_id, source_name)), Some((target_id, target_name))) =
                (source, target)
            else {
                dangling += 1;
                continue;
            };
            let relation_type = canonical_relation(&edge.relation);
            if let Some(whitelist) = &self.relation_whitelist {
                if !whitelist.contains(&relation_type) {
                    off_ontology += 1;
                    continue;
                }
            }
            let key = (*source_id, *target_id, relation_type.clone());
            match seen.get(&key).copied() {
                Some(slot) => {
                    let existing = &mut relations[slot];
                    existing.confidence = existing.confidence.max(edge.confidence.clamp(0.0, 1.0));
                }
                None => {
                    seen.insert(key, relations.len());
                    relations.push(Relation {
                        source_id: *source_id,
                        target_id: *target_id,
                        source_name: source_name.clone(),
                        target_name: target_name.clone(),
                        relation_type,
                        weight: 1.0,
                        confidence: edge.confidence.clamp(0.0, 1.0),
                        source_chunk_id: chunk.id,
                    });
                }
            }
        }

        if dangling > 0 {
            debug!(chunk_id = %chunk.id, dangling, "dropped edges with missing endpoints");
        }
        if off_ontology > 0 {
            debug!(chunk_id = %chunk.id, off_ontology, "dropped relations outside the ontology");
        }

        ChunkGraph {
            chunk_id: chunk.id,
            low_yield: entities.is_empty(),
            dangling_dropped: dangling,
            ontology_dropped: off_ontology,
            retries: 0,
            entities,
            relations,
        }
    }
}

/// Canonical casing for an allowed type, e.g. "person" -> "Person".
/// `None` when the given type is not in the allowed set.
fn canonical_type(given: &str, allowed: &[String]) -> Option<String> {
    allowed
        .iter()
        .find(|t| t.eq_ignore_ascii_case(given))
        .cloned()
}

/// Predicates are stored snake_case.
fn canonical_relation(given: &str) -> String {
    given
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}
