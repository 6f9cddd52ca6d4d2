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

//! Graph triplet retrieval.
//!
//! Seeds a bounded BFS with the entities most similar to the query, walks
//! their neighborhood, and ranks the incident triplets by a blend of seed
//! similarity, edge confidence and triplet quality. Ranked results then
//! pass a relevance floor and a type-balanced diversity cap before the
//! final cut. Vector lookups are capped; the full graph is never scanned.

use crate::{RetrievedItem, RetrievedKind, Retriever, RetrieverScope};
use async_trait::async_trait;
use noema_core::{
    GraphEdge, NoemaError, Result, RetrieveConfig, TokenBucket, EDGE_MENTIONS, NODE_ENTITY,
};
use noema_storage::{collection_name, Embedder, GraphStore, VectorStore};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Weight on the stronger endpoint's query similarity.
const W_SIMILARITY: f64 = 0.5;
/// Weight on the edge's extraction/validation confidence.
const W_CONFIDENCE: f64 = 0.3;
/// Weight on predicate/endpoint quality.
const W_QUALITY: f64 = 0.2;

/// Per-type endpoint cap applied by the diversity pass.
const MAX_PER_TYPE: usize = 2;

/// Predicates too generic to be informative on their own.
const GENERIC_PREDICATES: &[&str] = &["related_to", "relates_to", "associated_with", "linked_to"];

/// What the retriever knows about an edge endpoint.
struct EndpointInfo {
    name: String,
    description: String,
    entity_type: String,
}

/// A ranked triplet before the floor and diversity passes.
struct Candidate {
    item: RetrievedItem,
    source_id: Uuid,
    target_id: Uuid,
    source_type: String,
    target_type: String,
    relevance: f64,
}

/// Retrieves `(subject, predicate, object)` triplets around the entities
/// closest to the query.
pub struct GraphTripletRetriever {
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    limiter: Arc<TokenBucket>,
    scope: RetrieverScope,
    config: RetrieveConfig,
}

impl GraphTripletRetriever {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        limiter: Arc<TokenBucket>,
        scope: RetrieverScope,
        config: &RetrieveConfig,
    ) -> Self {
        Self {
            graph,
            vectors,
            embedder,
            limiter,
            scope,
            config: config.clone(),
        }
    }

    /// Entity ids similar to the query, with their best similarity.
    async fn seed_entities(&self, query: &str, top_k: usize) -> Result<HashMap<Uuid, f32>> {
        self.limiter.acquire().await;
        let mut vectors = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(NoemaError::from)?;
        let embedding = vectors
            .pop()
            .ok_or_else(|| NoemaError::transient("embedder returned no vector"))?;

        // Bounded candidate pull, never a full scan.
        let candidates = (10 * top_k).max(50);
        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        for field in ["name", "description"] {
            let collection = collection_name(
                self.scope.tenant_id,
                self.scope.dataset_id,
                NODE_ENTITY,
                field,
            );
            for hit in self
                .vectors
                .search(&collection, &embedding, candidates)
                .await?
            {
                if hit.score < self.config.similarity_threshold {
                    continue;
                }
                let entry = scores.entry(hit.id).or_insert(hit.score);
                if hit.score > *entry {
                    *entry = hit.score;
                }
            }
        }
        Ok(scores)
    }

    /// Bounded BFS from the seeds, collecting non-mention edges.
    async fn collect_edges(&self, seeds: &[Uuid]) -> Result<Vec<GraphEdge>> {
        let mut visited: HashSet<Uuid> = seeds.iter().copied().collect();
        let mut seen_edges: HashSet<(Uuid, Uuid, String)> = HashSet::new();
        let mut collected = Vec::new();
        let mut frontier: Vec<Uuid> = seeds.to_vec();

        for _ in 0..self.config.graph_depth {
            let mut next_frontier = Vec::new();
            for node in &frontier {
                for edge in self.graph.neighbors(*node, 1).await? {
                    if edge.edge_type == EDGE_MENTIONS {
                        continue;
                    }
                    let key = (edge.source_id, edge.target_id, edge.edge_type.clone());
                    if !seen_edges.insert(key) {
                        continue;
                    }
                    let other = if edge.source_id == *node {
                        edge.target_id
                    } else {
                        edge.source_id
                    };
                    if visited.len() < self.config.max_frontier && visited.insert(other) {
                        next_frontier.push(other);
                    }
                    collected.push(edge);
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }
        Ok(collected)
    }
}

fn quality_score(edge: &GraphEdge, infos: &HashMap<Uuid, EndpointInfo>) -> f64 {
    let specificity: f64 = if GENERIC_PREDICATES.contains(&edge.edge_type.as_str()) {
        0.2
    } else {
        0.8
    };
    let endpoint_bonus = |id: Uuid| {
        infos
            .get(&id)
            .map(|info| if info.description.is_empty() { 0.0 } else { 0.1 })
            .unwrap_or(0.0)
    };
    (specificity + endpoint_bonus(edge.source_id) + endpoint_bonus(edge.target_id)).min(1.0)
}

/// Query-to-text match: exact, containment with a near-full overlap, or
/// word overlap otherwise.
fn text_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }

    let words_a: HashSet<&str> = a.split_whitespace().collect();
    let words_b: HashSet<&str> = b.split_whitespace().collect();
    let union = words_a.union(&words_b).count();
    let mut score = if union == 0 {
        0.0
    } else {
        words_a.intersection(&words_b).count() as f64 / union as f64
    };

    if a.contains(&b) || b.contains(&a) {
        let shorter = a.len().min(b.len());
        let longer = a.len().max(b.len());
        if longer > 0 && shorter as f64 / longer as f64 >= 0.8 {
            score = score.max(0.9);
        }
    }
    score
}

/// Relevance of one endpoint to the query: vector similarity (0.4),
/// name/description text match (0.3, description discounted), attribute
/// completeness (0.2), neighborhood connectivity (0.1).
fn endpoint_relevance(
    query: &str,
    similarity: f64,
    info: Option<&EndpointInfo>,
    degree: usize,
) -> f64 {
    let (name, description) = match info {
        Some(info) => (info.name.as_str(), info.description.as_str()),
        None => ("", ""),
    };

    let vector_score = similarity.clamp(0.0, 1.0);
    let text_score = text_similarity(query, name).max(0.8 * text_similarity(query, description));
    let completeness = if !name.is_empty() || !description.is_empty() {
        0.5
    } else {
        0.2
    };
    let connectivity = (degree as f64 / 50.0).min(1.0);

    (vector_score * 0.4 + text_score * 0.3 + completeness * 0.2 + connectivity * 0.1).min(1.0)
}

/// Triplet relevance for the quality floor: the endpoint average carries
/// most of the weight, edge confidence the rest.
fn triplet_relevance(
    query: &str,
    edge: &GraphEdge,
    similarity: &HashMap<Uuid, f32>,
    infos: &HashMap<Uuid, EndpointInfo>,
    degrees: &HashMap<Uuid, usize>,
) -> f64 {
    let endpoint = |id: Uuid| {
        endpoint_relevance(
            query,
            similarity.get(&id).copied().unwrap_or(0.0) as f64,
            infos.get(&id),
            degrees.get(&id).copied().unwrap_or(0),
        )
    };
    let average = (endpoint(edge.source_id) + endpoint(edge.target_id)) / 2.0;
    average * 0.8 + edge.confidence.clamp(0.0, 1.0) * 0.2
}

/// Walk ranked candidates keeping type representation balanced: an edge
/// whose endpoints are both already included is skipped, and each type
/// contributes at most `max_per_type` endpoints unless one side is still
/// under the cap.
fn apply_diversity(candidates: Vec<Candidate>, max_per_type: usize) -> Vec<Candidate> {
    let mut kept = Vec::with_capacity(candidates.len());
    let mut type_counts: HashMap<String, usize> = HashMap::new();
    let mut seen_nodes: HashSet<Uuid> = HashSet::new();

    for candidate in candidates {
        let source_seen = seen_nodes.contains(&candidate.source_id);
        let target_seen = seen_nodes.contains(&candidate.target_id);
        if source_seen && target_seen {
            continue;
        }

        let source_count = type_counts.get(&candidate.source_type).copied().unwrap_or(0);
        let target_count = type_counts.get(&candidate.target_type).copied().unwrap_or(0);

        if source_count < max_per_type && target_count < max_per_type {
            *type_counts.entry(candidate.source_type.clone()).or_insert(0) += 1;
            *type_counts.entry(candidate.target_type.clone()).or_insert(0) += 1;
            seen_nodes.insert(candidate.source_id);
            seen_nodes.insert(candidate.target_id);
            kept.push(candidate);
        } else if source_count < max_per_type || target_count < max_per_type {
            if !source_seen {
                *type_counts.entry(candidate.source_type.clone()).or_insert(0) += 1;
                seen_nodes.insert(candidate.source_id);
            }
            if !target_seen {
                *type_counts.entry(candidate.target_type.clone()).or_insert(0) += 1;
                seen_nodes.insert(candidate.target_id);
            }
            kept.push(candidate);
        }
    }
    kept
}

#[async_trait]
impl Retriever for GraphTripletRetriever {
    fn name(&self) -> &'static str {
        "graph"
    }

    async fn get_context(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedItem>> {
        if query.trim().is_empty() {
            return Err(NoemaError::Validation("query must not be empty".into()));
        }

        let similarity = self.seed_entities(query, top_k).await?;
        if similarity.is_empty() {
            return Ok(Vec::new());
        }

        // Deterministic seed order: similarity desc, id asc.
        let mut seeds: Vec<(Uuid, f32)> = similarity.iter().map(|(k, v)| (*k, *v)).collect();
        seeds.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        seeds.truncate(self.config.max_frontier);
        let seed_ids: Vec<Uuid> = seeds.iter().map(|(id, _)| *id).collect();

        let edges = self.collect_edges(&seed_ids).await?;
        if edges.is_empty() {
            return Ok(Vec::new());
        }

        // Resolve endpoint names, descriptions and types, and count the
        // collected neighborhood's degrees for the relevance blend.
        let mut endpoint_ids: Vec<Uuid> = edges
            .iter()
            .flat_map(|e| [e.source_id, e.target_id])
            .collect();
        endpoint_ids.sort_unstable();
        endpoint_ids.dedup();
        let infos: HashMap<Uuid, EndpointInfo> = self
            .graph
            .nodes_by_ids(&endpoint_ids)
            .await?
            .into_iter()
            .map(|n| {
                let info = EndpointInfo {
                    name: n.text_property("name").unwrap_or_default().to_string(),
                    description: n
                        .properties
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    entity_type: n
                        .text_property("entity_type")
                        .unwrap_or_default()
                        .to_string(),
                };
                (n.id, info)
            })
            .collect();

        let mut degrees: HashMap<Uuid, usize> = HashMap::new();
        for edge in &edges {
            *degrees.entry(edge.source_id).or_insert(0) += 1;
            *degrees.entry(edge.target_id).or_insert(0) += 1;
        }

        let mut candidates: Vec<Candidate> = edges
            .iter()
            .map(|edge| {
                let subj_score = similarity.get(&edge.source_id).copied().unwrap_or(0.0) as f64;
                let obj_score = similarity.get(&edge.target_id).copied().unwrap_or(0.0) as f64;
                let score = W_SIMILARITY * subj_score.max(obj_score)
                    + W_CONFIDENCE * edge.confidence
                    + W_QUALITY * quality_score(edge, &infos);

                let endpoint = |id: Uuid| {
                    infos
                        .get(&id)
                        .map(|i| (i.name.clone(), i.entity_type.clone()))
                        .unwrap_or_else(|| ("?".to_string(), "unknown".to_string()))
                };
                let (subject, source_type) = endpoint(edge.source_id);
                let (object, target_type) = endpoint(edge.target_id);
                let predicate = edge.edge_type.replace('_', " ");
                let subject = if subject.is_empty() { "?".into() } else { subject };
                let object = if object.is_empty() { "?".into() } else { object };

                Candidate {
                    item: RetrievedItem {
                        id: Uuid::new_v5(
                            &edge.source_id,
                            format!("{}:{}", edge.target_id, edge.edge_type).as_bytes(),
                        ),
                        kind: RetrievedKind::Triplet,
                        text: format!("{subject} {predicate} {object}"),
                        score: score as f32,
                        provenance: None,
                    },
                    source_id: edge.source_id,
                    target_id: edge.target_id,
                    source_type,
                    target_type,
                    relevance: triplet_relevance(query, edge, &similarity, &infos, &degrees),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.item
                .score
                .partial_cmp(&a.item.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });

        let ranked = candidates.len();
        if self.config.min_quality > 0.0 {
            candidates.retain(|c| c.relevance >= self.config.min_quality);
        }
        let floored = candidates.len();
        if self.config.diversity_enabled {
            candidates = apply_diversity(candidates, MAX_PER_TYPE);
        }

        candidates.truncate(top_k);
        debug!(
            seeds = seed_ids.len(),
            ranked,
            after_floor = floored,
            results = candidates.len(),
            "graph retrieval complete"
        );
        Ok(candidates.into_iter().map(|c| c.item).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_core::{GraphNode, LimiterConfig};
    use noema_storage::{
        deterministic_embedding, CompletionError, HashEmbedder, InMemoryGraphStore,
        InMemoryVectorStore, VectorPoint,
    };
    use serde_json::{json, Map};

    fn entity_node(
        scope: RetrieverScope,
        name: &str,
        entity_type: &str,
        description: &str,
    ) -> GraphNode {
        GraphNode::new(
            noema_core::id::entity_id(scope.tenant_id, name, entity_type),
            NODE_ENTITY,
            scope.tenant_id,
            scope.dataset_id,
        )
        .with_property("name", name)
        .with_property("description", description)
        .with_property("entity_type", entity_type)
        .with_index_fields(&["name", "description"])
    }

    async fn index_name(
        vectors: &InMemoryVectorStore,
        scope: RetrieverScope,
        id: Uuid,
        name: &str,
    ) {
        let collection = collection_name(scope.tenant_id, scope.dataset_id, NODE_ENTITY, "name");
        let mut payload = Map::new();
        payload.insert("name".into(), json!(name));
        payload.insert("version".into(), json!(1));
        vectors
            .upsert(
                &collection,
                &[VectorPoint {
                    id,
                    vector: deterministic_embedding(name, 64),
                    payload,
                }],
            )
            .await
            .unwrap();
    }

    /// Traversal-focused config: the floor is off so hash-embedder
    /// fixtures (where non-seed endpoints score zero) keep their edges.
    fn traversal_config() -> RetrieveConfig {
        RetrieveConfig {
            min_quality: 0.0,
            ..Default::default()
        }
    }

    struct Fixture {
        retriever: GraphTripletRetriever,
        alice: Uuid,
        acme: Uuid,
        berlin: Uuid,
    }

    async fn fixture() -> Fixture {
        let graph = Arc::new(InMemoryGraphStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let scope = RetrieverScope {
            tenant_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
        };

        let alice_node = entity_node(scope, "alice", "Person", "Works at Acme.");
        let acme_node = entity_node(scope, "acme", "Organization", "A company in Berlin.");
        let berlin_node = entity_node(scope, "berlin", "Location", "A city.");
        let (alice, acme, berlin) = (alice_node.id, acme_node.id, berlin_node.id);

        graph
            .add_nodes(&[alice_node, acme_node, berlin_node])
            .await
            .unwrap();
        graph
            .add_edges(&[
                GraphEdge::new(alice, acme, "works_at").with_confidence(0.9),
                GraphEdge::new(acme, berlin, "based_in").with_confidence(0.8),
            ])
            .await
            .unwrap();

        for (id, name) in [(alice, "alice"), (acme, "acme"), (berlin, "berlin")] {
            index_name(&vectors, scope, id, name).await;
        }

        let retriever = GraphTripletRetriever::new(
            graph,
            vectors,
            Arc::new(HashEmbedder::new(64)),
            Arc::new(TokenBucket::new(LimiterConfig::default())),
            scope,
            &traversal_config(),
        );
        Fixture {
            retriever,
            alice,
            acme,
            berlin,
        }
    }

    #[tokio::test]
    async fn finds_triplets_around_the_matching_entity() {
        let f = fixture().await;
        let items = f.retriever.get_context("alice", 10).await.unwrap();

        assert!(!items.is_empty());
        assert!(items.iter().any(|i| i.text == "alice works at acme"));
        // Depth 2 reaches the second hop.
        assert!(items.iter().any(|i| i.text == "acme based in berlin"));
        let _ = (f.alice, f.acme, f.berlin);
    }

    #[tokio::test]
    async fn direct_triplet_outranks_distant_one() {
        let f = fixture().await;
        let items = f.retriever.get_context("alice", 10).await.unwrap();
        let direct = items.iter().position(|i| i.text == "alice works at acme");
        let distant = items.iter().position(|i| i.text == "acme based in berlin");
        assert!(direct.unwrap() < distant.unwrap());
    }

    #[tokio::test]
    async fn unrelated_query_returns_nothing() {
        let f = fixture().await;
        let items = f
            .retriever
            .get_context("quantum entanglement protocols", 10)
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    struct ConstantEmbedder;

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        async fn embed(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, CompletionError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    /// Everything embeds identically, so every entity seeds with
    /// similarity 1.0 and only text match, completeness and confidence
    /// separate the triplets.
    async fn constant_fixture(config: RetrieveConfig) -> GraphTripletRetriever {
        let graph = Arc::new(InMemoryGraphStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let scope = RetrieverScope {
            tenant_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
        };

        let alice = entity_node(scope, "alice", "Person", "Works at Acme.");
        let acme = entity_node(scope, "acme", "Organization", "Employer of alice.");
        // A weak corner of the graph: unnamed-looking entities, no
        // descriptions, and a low-confidence generic edge.
        let gadget = entity_node(scope, "zzz", "Other", "");
        let widget = entity_node(scope, "yyy", "Other", "");
        let ids = [alice.id, acme.id, gadget.id, widget.id];
        let names = ["alice", "acme", "zzz", "yyy"];

        graph
            .add_nodes(&[alice.clone(), acme.clone(), gadget.clone(), widget.clone()])
            .await
            .unwrap();
        graph
            .add_edges(&[
                GraphEdge::new(alice.id, acme.id, "works_at").with_confidence(0.95),
                GraphEdge::new(gadget.id, widget.id, "linked_to").with_confidence(0.2),
            ])
            .await
            .unwrap();

        let collection = collection_name(scope.tenant_id, scope.dataset_id, NODE_ENTITY, "name");
        for (id, name) in ids.iter().zip(names) {
            let mut payload = Map::new();
            payload.insert("name".into(), json!(name));
            payload.insert("version".into(), json!(1));
            vectors
                .upsert(
                    &collection,
                    &[VectorPoint {
                        id: *id,
                        vector: vec![1.0, 0.0],
                        payload,
                    }],
                )
                .await
                .unwrap();
        }

        GraphTripletRetriever::new(
            graph,
            vectors,
            Arc::new(ConstantEmbedder),
            Arc::new(TokenBucket::new(LimiterConfig::default())),
            scope,
            &config,
        )
    }

    #[tokio::test]
    async fn quality_floor_drops_weak_triplets() {
        let retriever = constant_fixture(RetrieveConfig::default()).await;
        let items = retriever.get_context("alice", 10).await.unwrap();

        assert!(items.iter().any(|i| i.text == "alice works at acme"));
        assert!(!items.iter().any(|i| i.text.contains("linked to")));

        // With the floor disabled the weak triplet comes back.
        let lenient = constant_fixture(traversal_config()).await;
        let items = lenient.get_context("alice", 10).await.unwrap();
        assert!(items.iter().any(|i| i.text.contains("linked to")));
    }

    #[tokio::test]
    async fn diversity_caps_repeated_types() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let vectors = Arc::new(InMemoryVectorStore::new());
        let scope = RetrieverScope {
            tenant_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
        };

        // One hub connected to four same-type satellites.
        let hub = entity_node(scope, "hub", "Person", "Central.");
        let mut nodes = vec![hub.clone()];
        let mut edges = Vec::new();
        for i in 0..4 {
            let satellite = entity_node(scope, &format!("org{i}"), "Organization", "");
            edges.push(GraphEdge::new(hub.id, satellite.id, "works_with").with_confidence(0.9));
            nodes.push(satellite);
        }
        graph.add_nodes(&nodes).await.unwrap();
        graph.add_edges(&edges).await.unwrap();
        index_name(&vectors, scope, hub.id, "hub").await;

        let retriever = GraphTripletRetriever::new(
            graph,
            vectors,
            Arc::new(HashEmbedder::new(64)),
            Arc::new(TokenBucket::new(LimiterConfig::default())),
            scope,
            &traversal_config(),
        );
        let items = retriever.get_context("hub", 10).await.unwrap();
        // Four ranked edges, but at most two Organization endpoints pass.
        assert_eq!(items.len(), 2);

        // Disabling the cap returns the whole fan.
        let uncapped = GraphTripletRetriever::new(
            retriever.graph.clone(),
            retriever.vectors.clone(),
            Arc::new(HashEmbedder::new(64)),
            Arc::new(TokenBucket::new(LimiterConfig::default())),
            scope,
            &RetrieveConfig {
                min_quality: 0.0,
                diversity_enabled: false,
                ..Default::default()
            },
        );
        let items = uncapped.get_context("hub", 10).await.unwrap();
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn generic_predicates_score_lower() {
        let infos: HashMap<Uuid, EndpointInfo> = HashMap::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let specific = GraphEdge::new(a, b, "works_at");
        let generic = GraphEdge::new(a, b, "related_to");
        assert!(quality_score(&specific, &infos) > quality_score(&generic, &infos));
    }

    #[test]
    fn text_similarity_boosts_containment() {
        assert_eq!(text_similarity("alice", "alice"), 1.0);
        assert!(text_similarity("acme widgets", "acme widgets co") >= 0.9);
        assert!(text_similarity("alice", "unrelated words") < 0.1);
    }

    #[test]
    fn relevance_rewards_matching_named_endpoints() {
        let matched = endpoint_relevance(
            "alice",
            1.0,
            Some(&EndpointInfo {
                name: "alice".into(),
                description: "Works at Acme.".into(),
                entity_type: "Person".into(),
            }),
            1,
        );
        let anonymous = endpoint_relevance("alice", 0.0, None, 0);
        assert!(matched > 0.7);
        assert!(anonymous < 0.1);
    }
}
