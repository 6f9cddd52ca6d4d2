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

//! End-to-end pipeline runs against the in-memory adapters and the
//! scripted language model.

use noema_core::{EventBus, HeuristicTokenizer, NoemaConfig, RateLimiterRegistry, RunEvent};
use noema_pipeline::{CognifyDeps, CognifyOptions, CognifyRunner, DocumentSource};
use noema_storage::{
    collection_name, DataRecord, Embedder, GraphStore, HashEmbedder, InMemoryGraphStore,
    InMemoryRelationalStore, InMemoryVectorStore, LanguageModel, LoaderRegistry, PipelineStatus,
    RawDocument, RelationalStore, RunStatus, ScriptedLanguageModel, VectorStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    runner: Arc<CognifyRunner>,
    relational: Arc<InMemoryRelationalStore>,
    graph: Arc<InMemoryGraphStore>,
    vectors: Arc<InMemoryVectorStore>,
    llm: Arc<ScriptedLanguageModel>,
    events: Arc<EventBus>,
    tenant: Uuid,
    dataset: Uuid,
    user: Uuid,
}

fn harness() -> Harness {
    let relational = Arc::new(InMemoryRelationalStore::new());
    let graph = Arc::new(InMemoryGraphStore::new());
    let vectors = Arc::new(InMemoryVectorStore::new());
    let llm = Arc::new(ScriptedLanguageModel::new());
    let events = EventBus::new();

    let runner = CognifyRunner::new(CognifyDeps {
        config: NoemaConfig::default(),
        relational: relational.clone(),
        graph: graph.clone(),
        vectors: vectors.clone(),
        llm: llm.clone() as Arc<dyn LanguageModel>,
        embedder: Arc::new(HashEmbedder::new(64)) as Arc<dyn Embedder>,
        limiters: RateLimiterRegistry::new(),
        events: events.clone(),
        tokenizer: Arc::new(HeuristicTokenizer::new()),
        loaders: Arc::new(LoaderRegistry::with_defaults()),
    });

    Harness {
        runner,
        relational,
        graph,
        vectors,
        llm,
        events,
        tenant: Uuid::new_v4(),
        dataset: Uuid::new_v4(),
        user: Uuid::new_v4(),
    }
}

impl Harness {
    async fn source(&self, path: &str, text: &str) -> DocumentSource {
        let hash = noema_core::id::content_hash(text.as_bytes());
        let data = DataRecord {
            id: noema_core::id::data_id(self.tenant, &hash),
            tenant_id: self.tenant,
            dataset_ids: vec![self.dataset],
            content_hash: hash,
            mime: "text/plain".to_string(),
            source_path: path.to_string(),
            token_count: {
                use noema_core::TokenEstimator;
                HeuristicTokenizer::new().count(text)
            },
            pipeline_status: PipelineStatus::Pending,
        };
        self.relational.persist_data(data.clone()).await.unwrap();
        DocumentSource {
            data,
            raw: RawDocument::text_file(path, text),
        }
    }

    fn options() -> CognifyOptions {
        CognifyOptions {
            validation_enabled: false,
            ..Default::default()
        }
    }
}

fn tiny_ingest_response() -> serde_json::Value {
    json!({
        "nodes": [
            {"name": "Alice", "type": "Person", "description": "Person who works at Acme.", "aliases": [], "confidence": 0.95},
            {"name": "Acme", "type": "Organization", "description": "Company based in Berlin.", "aliases": [], "confidence": 0.95},
            {"name": "Berlin", "type": "Location", "description": "City where Acme is based.", "aliases": [], "confidence": 0.9}
        ],
        "edges": [
            {"source": "Alice", "target": "Acme", "relation": "works_at", "confidence": 0.95},
            {"source": "Acme", "target": "Berlin", "relation": "based_in", "confidence": 0.9}
        ]
    })
}

#[tokio::test]
async fn tiny_ingest_builds_graph_and_vectors() {
    let h = harness();
    h.llm.respond_when("Alice works at Acme", tiny_ingest_response());

    let source = h
        .source("tiny.txt", "Alice works at Acme. Acme is based in Berlin.")
        .await;
    let run_id = h
        .runner
        .cognify(h.tenant, h.user, h.dataset, vec![source], Harness::options())
        .await
        .unwrap();

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    // 3 entities + 1 chunk node.
    assert_eq!(h.graph.count_nodes(h.dataset).await.unwrap(), 4);
    // works_at + based_in + 3 mentions edges.
    assert_eq!(h.graph.count_edges(h.dataset).await.unwrap(), 5);

    let alice_id = noema_core::id::entity_id(h.tenant, "alice", "Person");
    let acme_id = noema_core::id::entity_id(h.tenant, "acme", "Organization");
    let berlin_id = noema_core::id::entity_id(h.tenant, "berlin", "Location");
    let nodes = h
        .graph
        .nodes_by_ids(&[alice_id, acme_id, berlin_id])
        .await
        .unwrap();
    assert_eq!(nodes.len(), 3);

    let edges = h.graph.neighbors(alice_id, 2).await.unwrap();
    assert!(edges
        .iter()
        .any(|e| e.edge_type == "works_at" && e.source_id == alice_id && e.target_id == acme_id));
    assert!(edges
        .iter()
        .any(|e| e.edge_type == "based_in" && e.source_id == acme_id && e.target_id == berlin_id));

    // Vector records: one per entity per indexed field, one per chunk.
    let entity_names = collection_name(h.tenant, h.dataset, "Entity", "name");
    let entity_descriptions = collection_name(h.tenant, h.dataset, "Entity", "description");
    let chunk_texts = collection_name(h.tenant, h.dataset, "DocumentChunk", "text");
    assert_eq!(h.vectors.count(&entity_names).await.unwrap(), 3);
    assert_eq!(h.vectors.count(&entity_descriptions).await.unwrap(), 3);
    assert_eq!(h.vectors.count(&chunk_texts).await.unwrap(), 1);

    // Every vector record has a graph node with the same id.
    for collection in h.vectors.list_collections().await.unwrap() {
        for point in h.vectors.scroll(&collection, 100).await.unwrap() {
            assert!(h.graph.has_node(point.id).await.unwrap());
        }
    }
}

#[tokio::test]
async fn mentions_across_documents_deduplicate() {
    let h = harness();
    h.llm.respond_when(
        "Acme Corp. builds widgets",
        json!({
            "nodes": [{
                "name": "Acme Corp.", "type": "Organization",
                "description": "Widget manufacturer with a long history.",
                "aliases": ["Acme"], "confidence": 0.95
            }],
            "edges": []
        }),
    );
    h.llm.respond_when(
        "ACME shipped record volumes",
        json!({
            "nodes": [{
                "name": "ACME", "type": "Organization",
                "description": "Shipper of record volumes.",
                "aliases": ["Acme"], "confidence": 0.9
            }],
            "edges": []
        }),
    );

    let s1 = h.source("one.txt", "Acme Corp. builds widgets.").await;
    let s2 = h.source("two.txt", "ACME shipped record volumes.").await;
    let run_id = h
        .runner
        .cognify(h.tenant, h.user, h.dataset, vec![s1, s2], Harness::options())
        .await
        .unwrap();

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    // Exactly one organization entity remains (plus the two chunk nodes).
    assert_eq!(h.graph.count_nodes(h.dataset).await.unwrap(), 3);

    let canonical_id = noema_core::id::entity_id(h.tenant, "acme corp", "Organization");
    let nodes = h.graph.nodes_by_ids(&[canonical_id]).await.unwrap();
    assert_eq!(nodes.len(), 1);
    let aliases = nodes[0].properties.get("aliases").unwrap();
    assert!(aliases.as_array().unwrap().contains(&json!("ACME")));

    // Both chunks mention the canonical entity.
    let mentions = h
        .graph
        .neighbors(canonical_id, 1)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.edge_type == "mentions")
        .count();
    assert_eq!(mentions, 2);

    // The losing id resolves through the alias table.
    let losing_id = noema_core::id::entity_id(h.tenant, "acme", "Organization");
    assert_eq!(
        h.relational
            .resolve_alias(h.tenant, losing_id)
            .await
            .unwrap(),
        Some(canonical_id)
    );
}

#[tokio::test]
async fn same_name_different_type_stays_split() {
    let h = harness();
    h.llm.respond_when(
        "basketball player",
        json!({
            "nodes": [{"name": "Jordan", "type": "Person", "description": "Basketball player.", "aliases": []}],
            "edges": []
        }),
    );
    h.llm.respond_when(
        "is a country",
        json!({
            "nodes": [{"name": "Jordan", "type": "Location", "description": "A country.", "aliases": []}],
            "edges": []
        }),
    );

    let s1 = h.source("p.txt", "Jordan is a basketball player.").await;
    let s2 = h.source("c.txt", "Jordan is a country.").await;
    h.runner
        .cognify(h.tenant, h.user, h.dataset, vec![s1, s2], Harness::options())
        .await
        .unwrap();

    let person = noema_core::id::entity_id(h.tenant, "jordan", "Person");
    let location = noema_core::id::entity_id(h.tenant, "jordan", "Location");
    assert!(h.graph.has_node(person).await.unwrap());
    assert!(h.graph.has_node(location).await.unwrap());
    assert_eq!(
        h.relational.resolve_alias(h.tenant, person).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn empty_dataset_completes_with_zero_counters() {
    let h = harness();
    let run_id = h
        .runner
        .cognify(h.tenant, h.user, h.dataset, Vec::new(), Harness::options())
        .await
        .unwrap();

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    for stage in &run.stages {
        assert_eq!(stage.counters.items_in, 0);
        assert_eq!(stage.counters.items_out, 0);
    }
    assert_eq!(h.llm.call_count(), 0);
}

#[tokio::test]
async fn empty_document_yields_no_extraction_calls() {
    let h = harness();
    let source = h.source("empty.txt", "").await;
    let run_id = h
        .runner
        .cognify(h.tenant, h.user, h.dataset, vec![source], Harness::options())
        .await
        .unwrap();

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.llm.call_count(), 0);
    assert_eq!(h.graph.count_nodes(h.dataset).await.unwrap(), 0);
}

#[tokio::test]
async fn rerun_is_idempotent_with_zero_writes() {
    let h = harness();
    h.llm.respond_when("Alice works at Acme", tiny_ingest_response());
    let text = "Alice works at Acme. Acme is based in Berlin.";

    let s1 = h.source("tiny.txt", text).await;
    h.runner
        .cognify(h.tenant, h.user, h.dataset, vec![s1], Harness::options())
        .await
        .unwrap();

    let nodes_before = h.graph.count_nodes(h.dataset).await.unwrap();
    let edges_before = h.graph.count_edges(h.dataset).await.unwrap();
    let chunk_collection = collection_name(h.tenant, h.dataset, "DocumentChunk", "text");
    let vectors_before = h.vectors.count(&chunk_collection).await.unwrap();

    let s2 = h.source("tiny.txt", text).await;
    let second_run_id = h
        .runner
        .cognify(h.tenant, h.user, h.dataset, vec![s2], Harness::options())
        .await
        .unwrap();

    assert_eq!(h.graph.count_nodes(h.dataset).await.unwrap(), nodes_before);
    assert_eq!(h.graph.count_edges(h.dataset).await.unwrap(), edges_before);
    assert_eq!(
        h.vectors.count(&chunk_collection).await.unwrap(),
        vectors_before
    );

    let second = h.relational.get_run(second_run_id).await.unwrap().unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    let write_stage = second
        .stages
        .iter()
        .find(|s| s.stage == "write")
        .expect("write stage recorded");
    assert_eq!(write_stage.counters.items_out, 0);
}

#[tokio::test]
async fn cancellation_stops_further_llm_calls() {
    let h = harness();
    // Each extraction call takes 200ms, so the run is mid-flight when the
    // cancel signal lands.
    h.llm.set_latency(Duration::from_millis(200));
    h.llm.set_default_structured(json!({"nodes": [], "edges": []}));

    // Enough text for several chunks.
    let paragraphs: Vec<String> = (0..120)
        .map(|i| format!("Paragraph number {i} talks about topic {i} at length, with several sentences of filler to give the chunker something to cut."))
        .collect();
    let text = paragraphs.join("\n\n");
    let source = h.source("long.txt", &text).await;

    let run_id = h
        .runner
        .cognify(
            h.tenant,
            h.user,
            h.dataset,
            vec![source],
            CognifyOptions {
                run_in_background: true,
                ..Harness::options()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.runner.cancel(run_id));

    // Wait for the run to reach a terminal state.
    let mut cancelled = false;
    for _ in 0..100 {
        let run = h.relational.get_run(run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            cancelled = run.status == RunStatus::Cancelled;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(cancelled, "run did not end cancelled");

    // No new provider calls begin once the run is finalized.
    let calls_at_cancel = h.llm.call_count();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.llm.call_count(), calls_at_cancel);
}

#[tokio::test]
async fn distillation_indexes_cross_chunk_knowledge() {
    let h = harness();
    // Rule order matters: the document text also appears inside the
    // distillation prompt, so the distillation rule must match first.
    h.llm.respond_when(
        "distilling cross-cutting knowledge",
        json!({
            "items": [
                {"type": "qa", "text": "Q: Where is Acme based? A: Berlin."}
            ]
        }),
    );
    h.llm.respond_when("Alice works at Acme", tiny_ingest_response());

    let source = h
        .source("tiny.txt", "Alice works at Acme. Acme is based in Berlin.")
        .await;
    let run_id = h
        .runner
        .cognify(
            h.tenant,
            h.user,
            h.dataset,
            vec![source],
            CognifyOptions {
                validation_enabled: false,
                distillation_enabled: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let distill_stage = run.stages.iter().find(|s| s.stage == "distill").unwrap();
    assert_eq!(distill_stage.counters.items_out, 1);

    let collection = collection_name(h.tenant, h.dataset, "Distillation", "text");
    assert_eq!(h.vectors.count(&collection).await.unwrap(), 1);
}

#[tokio::test]
async fn validation_filters_low_confidence_relations() {
    let h = harness();
    // The validation prompt quotes the source text, so its rule must be
    // registered ahead of the extraction rule to match first.
    h.llm.respond_when(
        "You are validating relations",
        json!({
            "scores": [
                {"index": 0, "confidence": 0.95, "reason": "explicit"},
                {"index": 1, "confidence": 0.2, "reason": "unsupported"}
            ]
        }),
    );
    h.llm.respond_when("Alice works at Acme", tiny_ingest_response());

    let source = h
        .source("tiny.txt", "Alice works at Acme. Acme is based in Berlin.")
        .await;
    let run_id = h
        .runner
        .cognify(
            h.tenant,
            h.user,
            h.dataset,
            vec![source],
            CognifyOptions {
                validation_enabled: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let validate_stage = run.stages.iter().find(|s| s.stage == "validate").unwrap();
    assert_eq!(validate_stage.counters.dropped, 1);

    // Only works_at survives; based_in was pruned before writing.
    let alice_id = noema_core::id::entity_id(h.tenant, "alice", "Person");
    let edges = h.graph.neighbors(alice_id, 2).await.unwrap();
    assert!(edges.iter().any(|e| e.edge_type == "works_at"));
    assert!(!edges.iter().any(|e| e.edge_type == "based_in"));
}

#[tokio::test]
async fn run_events_stream_in_order() {
    let h = harness();
    h.llm.respond_when("Alice works at Acme", tiny_ingest_response());
    // Slow the provider down so the subscription attaches before the
    // background run finishes.
    h.llm.set_latency(Duration::from_millis(100));

    let source = h
        .source("tiny.txt", "Alice works at Acme. Acme is based in Berlin.")
        .await;

    // Start in the background so we can subscribe before completion.
    let run_id = h
        .runner
        .cognify(
            h.tenant,
            h.user,
            h.dataset,
            vec![source],
            CognifyOptions {
                run_in_background: true,
                ..Harness::options()
            },
        )
        .await
        .unwrap();
    let mut rx = h.events.subscribe(run_id);

    // Fast early stages may complete before the subscription attaches, so
    // only the streamed tail is asserted against the persisted order.
    let mut streamed = Vec::new();
    let mut completed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("run did not finish in time");
        match event {
            Ok(RunEvent::StageCompleted { stage, .. }) => streamed.push(stage),
            Ok(RunEvent::RunCompleted { .. }) => {
                completed = true;
                break;
            }
            Ok(RunEvent::RunFailed { message, .. }) => panic!("run failed: {message}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let run = h.relational.get_run(run_id).await.unwrap().unwrap();
    let persisted: Vec<String> = run.stages.iter().map(|s| s.stage.clone()).collect();
    assert_eq!(persisted, vec!["load", "chunk", "extract", "resolve", "write"]);
    if completed {
        // Whatever was streamed is a suffix of the persisted order.
        assert!(persisted.ends_with(&streamed));
        assert!(streamed.contains(&"write".to_string()));
    }
}
