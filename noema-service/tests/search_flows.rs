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

//! Ingest-then-search flows through the full facade.

use noema_core::{NoemaConfig, NoemaError};
use noema_pipeline::CognifyOptions;
use noema_retrieval::NO_CONTEXT_ANSWER;
use noema_service::{Noema, SearchFilters, SearchRequest, SearchType};
use noema_storage::{HashEmbedder, RunStatus, ScriptedLanguageModel};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const TINY_DOC: &str = "Alice works at Acme. Acme is based in Berlin.";

struct World {
    noema: Noema,
    llm: Arc<ScriptedLanguageModel>,
    tenant: Uuid,
    dataset: Uuid,
}

async fn ingested_world() -> World {
    let llm = Arc::new(ScriptedLanguageModel::new());
    llm.respond_when(
        "Alice works at Acme",
        json!({
            "nodes": [
                {"name": "Alice", "type": "Person", "description": "Works at Acme.", "aliases": [], "confidence": 0.95},
                {"name": "Acme", "type": "Organization", "description": "Company in Berlin.", "aliases": [], "confidence": 0.95},
                {"name": "Berlin", "type": "Location", "description": "A city.", "aliases": [], "confidence": 0.9}
            ],
            "edges": [
                {"source": "Alice", "target": "Acme", "relation": "works_at", "confidence": 0.95},
                {"source": "Acme", "target": "Berlin", "relation": "based_in", "confidence": 0.9}
            ]
        }),
    );

    // The deterministic test embedder gives non-seed endpoints no vector
    // support, so the triplet quality floor is disabled for these flows;
    // the floor itself is covered by the retrieval unit tests.
    let mut config = NoemaConfig::default();
    config.retrieve.min_quality = 0.0;

    let noema = Noema::builder()
        .config(config)
        .llm(llm.clone())
        .embedder(Arc::new(HashEmbedder::new(64)))
        .build()
        .unwrap();

    let tenant = Uuid::new_v4();
    let user = Uuid::new_v4();
    let dataset = noema.create_dataset(tenant, user, "docs").await.unwrap();
    noema
        .add_text(tenant, dataset.id, "tiny.txt", TINY_DOC)
        .await
        .unwrap();

    let runs = noema
        .cognify(
            tenant,
            user,
            &[dataset.id],
            CognifyOptions {
                validation_enabled: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let run = noema.get_run(runs[0]).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    World {
        noema,
        llm,
        tenant,
        dataset: dataset.id,
    }
}

fn request(world: &World, query: &str, search_type: SearchType) -> SearchRequest {
    SearchRequest {
        tenant_id: world.tenant,
        datasets: vec![world.dataset],
        query: query.to_string(),
        search_type,
        top_k: None,
        filters: SearchFilters::default(),
        session_id: None,
    }
}

#[tokio::test]
async fn chunks_search_returns_raw_context() {
    let world = ingested_world().await;
    let response = world
        .noema
        .search(request(&world, TINY_DOC, SearchType::Chunks))
        .await
        .unwrap();

    assert!(response.result.is_none());
    assert_eq!(response.context.len(), 1);
    assert_eq!(response.context[0].text, TINY_DOC);
    let provenance = response.context[0].provenance.as_ref().unwrap();
    assert_eq!(provenance.source_path.as_deref(), Some("tiny.txt"));
    assert_eq!(provenance.start_line, 1);
}

#[tokio::test]
async fn rag_search_grounds_an_answer() {
    let world = ingested_world().await;
    world
        .llm
        .complete_when("Alice works at Acme", "Alice works at Acme [1].");

    let response = world
        .noema
        .search(request(&world, TINY_DOC, SearchType::Rag))
        .await
        .unwrap();

    assert_eq!(response.result.as_deref(), Some("Alice works at Acme [1]."));
    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].index, 1);
    assert!(!response.degraded);
}

#[tokio::test]
async fn graph_completion_returns_triplets() {
    let world = ingested_world().await;
    world
        .llm
        .complete_when("QUESTION", "Acme employs Alice and is based in Berlin [1][2].");

    let response = world
        .noema
        .search(request(&world, "Alice", SearchType::GraphCompletion))
        .await
        .unwrap();

    let snippet = response.graph_snippet.as_ref().unwrap();
    assert!(snippet.iter().any(|t| t == "Alice works at Acme"));
    assert!(snippet.iter().any(|t| t == "Acme based in Berlin"));
    assert!(response.result.is_some());
}

#[tokio::test]
async fn hybrid_search_fuses_strategies() {
    let world = ingested_world().await;
    world.llm.set_default_completion("Fused answer [1].");

    let response = world
        .noema
        .search(request(&world, TINY_DOC, SearchType::Hybrid))
        .await
        .unwrap();

    assert!(!response.degraded);
    assert!(!response.context.is_empty());
    // Vector and lexical both surface the single chunk; fusion dedups it.
    assert_eq!(response.context.len(), 1);
    assert_eq!(response.result.as_deref(), Some("Fused answer [1]."));
}

#[tokio::test]
async fn natural_language_uses_the_hybrid_path() {
    let world = ingested_world().await;
    world.llm.set_default_completion("Natural answer.");

    let response = world
        .noema
        .search(request(&world, TINY_DOC, SearchType::NaturalLanguage))
        .await
        .unwrap();
    assert!(response.result.is_some());
    assert!(!response.context.is_empty());
}

#[tokio::test]
async fn unmatched_query_returns_the_fixed_fallback() {
    let world = ingested_world().await;
    let response = world
        .noema
        .search(request(
            &world,
            "entirely unrelated question about satellites",
            SearchType::Rag,
        ))
        .await
        .unwrap();

    assert_eq!(response.result.as_deref(), Some(NO_CONTEXT_ANSWER));
    assert!(response.context.is_empty());
    assert!(response.citations.is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let world = ingested_world().await;

    let err = world
        .noema
        .search(SearchRequest {
            top_k: Some(0),
            ..request(&world, "anything", SearchType::Chunks)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NoemaError::Validation(_)));

    let err = world
        .noema
        .search(SearchRequest {
            datasets: vec![Uuid::new_v4()],
            ..request(&world, "anything", SearchType::Chunks)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NoemaError::NotFound { .. }));

    let err = world
        .noema
        .search(SearchRequest {
            query: "  ".into(),
            ..request(&world, "anything", SearchType::Chunks)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NoemaError::Validation(_)));
}

#[tokio::test]
async fn other_tenants_cannot_see_the_dataset() {
    let world = ingested_world().await;
    let err = world
        .noema
        .search(SearchRequest {
            tenant_id: Uuid::new_v4(),
            ..request(&world, TINY_DOC, SearchType::Chunks)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NoemaError::NotFound { .. }));
}

#[tokio::test]
async fn source_path_filter_restricts_context() {
    let world = ingested_world().await;

    let mut matching = request(&world, TINY_DOC, SearchType::Chunks);
    matching.filters = SearchFilters {
        source_paths: vec!["tiny.txt".to_string()],
        min_score: None,
    };
    let response = world.noema.search(matching).await.unwrap();
    assert_eq!(response.context.len(), 1);

    let mut mismatched = request(&world, TINY_DOC, SearchType::Chunks);
    mismatched.filters = SearchFilters {
        source_paths: vec!["other.txt".to_string()],
        min_score: None,
    };
    let response = world.noema.search(mismatched).await.unwrap();
    assert!(response.context.is_empty());
}
