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

//! Noema Service
//!
//! The composition root. [`Noema`] wires the storage, model and loader
//! ports into the ingestion pipeline and the retrieval strategies, and
//! exposes the three operations outer layers call: `cognify`,
//! `subscribe_run` and `search`. HTTP, auth and tenancy enforcement live
//! outside; callers arrive here already authenticated and scoped.

pub mod search;

use dashmap::DashMap;
use noema_core::{
    EventBus, HeuristicTokenizer, NoemaConfig, NoemaError, RateLimiterRegistry, Result, RunEvent,
    TokenEstimator,
};
use noema_pipeline::{CognifyDeps, CognifyOptions, CognifyRunner, DocumentSource};
use noema_retrieval::{AnswerGenerator, Reranker};
use noema_storage::{
    DataRecord, DatasetRecord, Embedder, GraphStore, InMemoryGraphStore, InMemoryRelationalStore,
    InMemoryVectorStore, LanguageModel, LoaderRegistry, PayloadFilter, PipelineRunRecord,
    PipelineStatus, RawDocument, RelationalStore, VectorStore,
};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

pub use noema_pipeline::ChunkerKind;
pub use search::{SearchFilters, SearchRequest, SearchResponse, SearchType};

/// The engine facade.
pub struct Noema {
    config: NoemaConfig,
    relational: Arc<dyn RelationalStore>,
    graph: Arc<dyn GraphStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    limiters: Arc<RateLimiterRegistry>,
    events: Arc<EventBus>,
    runner: Arc<CognifyRunner>,
    answerer: AnswerGenerator,
    reranker: Option<Arc<dyn Reranker>>,
    /// Raw bytes registry standing in for external file storage.
    raw_store: DashMap<Uuid, RawDocument>,
}

impl std::fmt::Debug for Noema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Noema").finish_non_exhaustive()
    }
}

impl Noema {
    pub fn builder() -> NoemaBuilder {
        NoemaBuilder::default()
    }

    pub fn config(&self) -> &NoemaConfig {
        &self.config
    }

    /// Create a dataset. `(tenant, name)` must be unique.
    pub async fn create_dataset(
        &self,
        tenant_id: Uuid,
        owner_id: Uuid,
        name: &str,
    ) -> Result<DatasetRecord> {
        if name.trim().is_empty() {
            return Err(NoemaError::Validation("dataset name must not be empty".into()));
        }
        let dataset = DatasetRecord::new(tenant_id, owner_id, name.trim());
        self.relational.create_dataset(dataset.clone()).await?;
        info!(dataset_id = %dataset.id, name = %dataset.name, "dataset created");
        Ok(dataset)
    }

    /// Register a text document under a dataset. Identical content within
    /// the tenant dedups to the existing data id.
    pub async fn add_text(
        &self,
        tenant_id: Uuid,
        dataset_id: Uuid,
        path: &str,
        text: &str,
    ) -> Result<Uuid> {
        self.require_dataset(tenant_id, dataset_id).await?;

        let hash = noema_core::id::content_hash(text.as_bytes());
        if let Some(existing) = self.relational.dedup_data(tenant_id, &hash).await? {
            info!(data_id = %existing, "content already ingested, reusing");
            return Ok(existing);
        }

        let raw = RawDocument::text_file(path, text);
        let data = DataRecord {
            id: noema_core::id::data_id(tenant_id, &hash),
            tenant_id,
            dataset_ids: vec![dataset_id],
            content_hash: hash,
            mime: raw.mime.clone(),
            source_path: path.to_string(),
            token_count: HeuristicTokenizer::new().count(text),
            pipeline_status: PipelineStatus::Pending,
        };
        let data_id = data.id;
        self.relational.persist_data(data).await?;
        self.raw_store.insert(data_id, raw);
        Ok(data_id)
    }

    /// Delete a dataset and every downstream artifact: relational rows,
    /// the subgraph, and its vector collections. Per-store, no cross-store
    /// transaction.
    pub async fn delete_dataset(&self, tenant_id: Uuid, dataset_id: Uuid) -> Result<()> {
        self.require_dataset(tenant_id, dataset_id).await?;
        self.relational.delete_dataset(tenant_id, dataset_id).await?;
        self.graph.delete_subgraph(dataset_id).await?;

        let marker = dataset_id.simple().to_string();
        let filter = PayloadFilter::dataset(dataset_id);
        for collection in self.vectors.list_collections().await? {
            if collection.contains(&marker) {
                self.vectors.delete_by_filter(&collection, &filter).await?;
            }
        }
        info!(dataset_id = %dataset_id, "dataset deleted");
        Ok(())
    }

    /// Run the ingestion pipeline over each dataset. Returns one run id
    /// per dataset, in input order.
    pub async fn cognify(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        datasets: &[Uuid],
        opts: CognifyOptions,
    ) -> Result<Vec<Uuid>> {
        if datasets.is_empty() {
            return Err(NoemaError::Validation("at least one dataset is required".into()));
        }

        let mut run_ids = Vec::with_capacity(datasets.len());
        for &dataset_id in datasets {
            self.require_dataset(tenant_id, dataset_id).await?;
            let sources = self.sources_for(dataset_id).await?;
            let run_id = self
                .runner
                .cognify(tenant_id, user_id, dataset_id, sources, opts.clone())
                .await?;
            run_ids.push(run_id);
        }
        Ok(run_ids)
    }

    /// Live event stream for a run. Lossy for slow consumers.
    pub fn subscribe_run(&self, run_id: Uuid) -> BroadcastStream<RunEvent> {
        BroadcastStream::new(self.events.subscribe(run_id))
    }

    /// Request cancellation of a live run.
    pub fn cancel_run(&self, run_id: Uuid) -> bool {
        self.runner.cancel(run_id)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRunRecord> {
        self.relational
            .get_run(run_id)
            .await?
            .ok_or_else(|| NoemaError::NotFound {
                kind: "pipeline_run",
                id: run_id.to_string(),
            })
    }

    async fn require_dataset(&self, tenant_id: Uuid, dataset_id: Uuid) -> Result<DatasetRecord> {
        self.relational
            .get_dataset(tenant_id, dataset_id)
            .await?
            .ok_or_else(|| NoemaError::NotFound {
                kind: "dataset",
                id: dataset_id.to_string(),
            })
    }

    async fn sources_for(&self, dataset_id: Uuid) -> Result<Vec<DocumentSource>> {
        let mut sources = Vec::new();
        for data in self.relational.list_data(dataset_id).await? {
            let Some(raw) = self.raw_store.get(&data.id).map(|r| r.clone()) else {
                // Content registered in a previous process; the pipeline
                // can only reprocess what the file layer still holds.
                continue;
            };
            sources.push(DocumentSource { data, raw });
        }
        Ok(sources)
    }
}

/// Builder for [`Noema`]. The model and embedder ports are required;
/// stores default to the in-memory adapters.
#[derive(Default)]
pub struct NoemaBuilder {
    config: Option<NoemaConfig>,
    relational: Option<Arc<dyn RelationalStore>>,
    graph: Option<Arc<dyn GraphStore>>,
    vectors: Option<Arc<dyn VectorStore>>,
    llm: Option<Arc<dyn LanguageModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    tokenizer: Option<Arc<dyn TokenEstimator>>,
    loaders: Option<LoaderRegistry>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl NoemaBuilder {
    pub fn config(mut self, config: NoemaConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn relational(mut self, store: Arc<dyn RelationalStore>) -> Self {
        self.relational = Some(store);
        self
    }

    pub fn graph(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.graph = Some(store);
        self
    }

    pub fn vectors(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(store);
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn tokenizer(mut self, tokenizer: Arc<dyn TokenEstimator>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.loaders = Some(loaders);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn build(self) -> Result<Noema> {
        let llm = self
            .llm
            .ok_or_else(|| NoemaError::Validation("a language model is required".into()))?;
        let embedder = self
            .embedder
            .ok_or_else(|| NoemaError::Validation("an embedder is required".into()))?;

        let config = self.config.unwrap_or_default();
        let relational = self
            .relational
            .unwrap_or_else(|| Arc::new(InMemoryRelationalStore::new()));
        let graph = self
            .graph
            .unwrap_or_else(|| Arc::new(InMemoryGraphStore::new()));
        let vectors = self
            .vectors
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new()));
        let tokenizer = self
            .tokenizer
            .unwrap_or_else(|| Arc::new(HeuristicTokenizer::new()));
        let loaders = Arc::new(self.loaders.unwrap_or_else(LoaderRegistry::with_defaults));
        let limiters = RateLimiterRegistry::new();
        let events = EventBus::new();

        let runner = CognifyRunner::new(CognifyDeps {
            config: config.clone(),
            relational: relational.clone(),
            graph: graph.clone(),
            vectors: vectors.clone(),
            llm: llm.clone(),
            embedder: embedder.clone(),
            limiters: limiters.clone(),
            events: events.clone(),
            tokenizer,
            loaders,
        });

        let answer_bucket = limiters.bucket(&config.extractor.model, "chat");
        let answerer = AnswerGenerator::new(llm, answer_bucket, &config);

        Ok(Noema {
            config,
            relational,
            graph,
            vectors,
            embedder,
            limiters,
            events,
            runner,
            answerer,
            reranker: self.reranker,
            raw_store: DashMap::new(),
        })
    }
}
