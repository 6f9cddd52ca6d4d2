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

//! The ingestion ("cognify") pipeline: load, chunk, extract, optionally
//! distill and validate, resolve, write.
//!
//! One [`CognifyRunner`] per process assembles the stage list for each run,
//! persists the run row up front so callers always get a run id, and
//! executes inline or in the background. Runs are independently
//! cancellable.

use crate::chunk::{ChunkableDocument, DocumentChunk, DocumentSource, TextChunker};
use crate::distill::KnowledgeDistiller;
use crate::engine::{
    run_parallel, ExecutionMode, PipelineEngine, RunContext, Stage, StageData, StageReport,
};
use crate::extract::{GraphExtractor, Relation};
use crate::resolve::{collapse_identical, EntityResolver};
use crate::validate::RelationValidator;
use crate::write::GraphVectorWriter;
use dashmap::DashMap;
use noema_core::{
    EventBus, GraphEdge, GraphNode, GraphProjection, NoemaConfig, NoemaError,
    RateLimiterRegistry, Result, TokenEstimator,
};
use noema_storage::{
    Embedder, GraphStore, LanguageModel, LoaderRegistry, PipelineRunRecord, PipelineStatus,
    RelationalStore, RunStatus, VectorStore,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Chunking strategy requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkerKind {
    #[default]
    Text,
    Semantic,
    Llm,
}

/// Per-run options, all optional over the configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CognifyOptions {
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub chunker: ChunkerKind,
    /// Override the extraction model for this run.
    pub graph_model: Option<String>,
    /// Time-graph variant; not available yet.
    pub temporal: bool,
    pub validation_enabled: bool,
    pub resolution_enabled: bool,
    pub distillation_enabled: bool,
    pub run_in_background: bool,
}

impl Default for CognifyOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            chunk_overlap: None,
            chunker: ChunkerKind::Text,
            graph_model: None,
            temporal: false,
            validation_enabled: true,
            resolution_enabled: true,
            distillation_enabled: false,
            run_in_background: false,
        }
    }
}

/// Everything the runner needs, wired once at the composition root.
pub struct CognifyDeps {
    pub config: NoemaConfig,
    pub relational: Arc<dyn RelationalStore>,
    pub graph: Arc<dyn GraphStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub llm: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub limiters: Arc<RateLimiterRegistry>,
    pub events: Arc<EventBus>,
    pub tokenizer: Arc<dyn TokenEstimator>,
    pub loaders: Arc<LoaderRegistry>,
}

/// Assembles and executes ingestion runs.
pub struct CognifyRunner {
    deps: CognifyDeps,
    active: DashMap<Uuid, CancellationToken>,
}

impl CognifyRunner {
    pub fn new(deps: CognifyDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            active: DashMap::new(),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.deps.events
    }

    /// Signal cancellation for a live run. Returns false when the run is
    /// not active (already finished or unknown).
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Start a pipeline run over the given sources. The run row is
    /// persisted before this returns, so the id can be subscribed to
    /// immediately; with `run_in_background` the pipeline continues after
    /// return.
    pub async fn cognify(
        self: &Arc<Self>,
        tenant_id: Uuid,
        user_id: Uuid,
        dataset_id: Uuid,
        sources: Vec<DocumentSource>,
        opts: CognifyOptions,
    ) -> Result<Uuid> {
        validate_options(&opts)?;

        let run = PipelineRunRecord::new(dataset_id, user_id);
        let run_id = run.id;
        self.deps.relational.create_run(run.clone()).await?;

        let cancel = CancellationToken::new();
        self.active.insert(run_id, cancel.clone());
        let ctx = RunContext {
            run_id,
            tenant_id,
            dataset_id,
            user_id,
            cancel,
            workers: self.deps.config.workers.effective_pool(),
        };

        if opts.run_in_background {
            let runner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.execute(run, ctx, sources, opts).await {
                    warn!(run_id = %run_id, error = %e, "background run aborted");
                }
            });
        } else {
            self.clone().execute(run, ctx, sources, opts).await?;
        }
        Ok(run_id)
    }

    async fn execute(
        self: Arc<Self>,
        run: PipelineRunRecord,
        ctx: RunContext,
        sources: Vec<DocumentSource>,
        opts: CognifyOptions,
    ) -> Result<PipelineRunRecord> {
        let data_ids: Vec<Uuid> = sources.iter().map(|s| s.data.id).collect();
        let config = self.effective_config(&opts);
        let stages = self.build_stages(&config, &opts);
        let engine = PipelineEngine::new(self.deps.relational.clone(), self.deps.events.clone());

        let result = engine
            .run(run, &stages, StageData::Sources(sources), &ctx)
            .await;
        self.active.remove(&ctx.run_id);

        if let Ok(record) = &result {
            if record.status != RunStatus::Completed {
                for data_id in data_ids {
                    let _ = self
                        .deps
                        .relational
                        .set_pipeline_status(data_id, PipelineStatus::Failed)
                        .await;
                }
            }
        }
        result
    }

    /// Per-run config: options override the process defaults.
    fn effective_config(&self, opts: &CognifyOptions) -> NoemaConfig {
        let mut config = self.deps.config.clone();
        if let Some(size) = opts.chunk_size {
            config.chunk.size = size;
        }
        if let Some(overlap) = opts.chunk_overlap {
            config.chunk.overlap = overlap;
        }
        if let Some(model) = &opts.graph_model {
            config.extractor.model = model.clone();
        }
        config
    }

    fn build_stages(&self, config: &NoemaConfig, opts: &CognifyOptions) -> Vec<Box<dyn Stage>> {
        let chat_bucket = self.deps.limiters.bucket(&config.extractor.model, "chat");
        let embed_bucket = self.deps.limiters.bucket("embedder", "embed");

        let extractor = Arc::new(GraphExtractor::new(
            self.deps.llm.clone(),
            chat_bucket.clone(),
            config,
        ));
        let writer = Arc::new(GraphVectorWriter::new(
            self.deps.graph.clone(),
            self.deps.vectors.clone(),
            self.deps.embedder.clone(),
            embed_bucket,
            config,
        ));

        let mut stages: Vec<Box<dyn Stage>> = vec![
            Box::new(LoadStage {
                loaders: self.deps.loaders.clone(),
                relational: self.deps.relational.clone(),
            }),
            Box::new(ChunkStage {
                tokenizer: self.deps.tokenizer.clone(),
                max_tokens: config.chunk.size,
                overlap: config.chunk.overlap,
            }),
            Box::new(ExtractStage { extractor }),
        ];

        if opts.distillation_enabled {
            stages.push(Box::new(DistillStage {
                distiller: Arc::new(KnowledgeDistiller::new(
                    self.deps.llm.clone(),
                    chat_bucket.clone(),
                    config,
                )),
                writer: writer.clone(),
            }));
        }
        if opts.validation_enabled {
            stages.push(Box::new(ValidateStage {
                validator: Arc::new(RelationValidator::new(
                    Some(self.deps.llm.clone()),
                    chat_bucket,
                    config,
                )),
            }));
        }
        stages.push(Box::new(ResolveStage {
            resolver: Arc::new(EntityResolver::new(
                config.resolve.clone(),
                Some(self.deps.embedder.clone()),
            )),
            relational: self.deps.relational.clone(),
            enabled: opts.resolution_enabled,
        }));
        stages.push(Box::new(WriteStage {
            writer,
            relational: self.deps.relational.clone(),
        }));
        stages
    }
}

fn validate_options(opts: &CognifyOptions) -> Result<()> {
    if opts.temporal {
        return Err(NoemaError::Validation(
            "temporal graph mode is not available".to_string(),
        ));
    }
    if opts.chunker != ChunkerKind::Text {
        return Err(NoemaError::Validation(format!(
            "chunker {:?} is not available; only text chunking is wired",
            opts.chunker
        )));
    }
    if opts.chunk_size == Some(0) {
        return Err(NoemaError::Validation("chunk_size must be positive".into()));
    }
    if let (Some(size), Some(overlap)) = (
        opts.chunk_size.or(Some(512)),
        opts.chunk_overlap,
    ) {
        if overlap >= size {
            return Err(NoemaError::Validation(
                "chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
    }
    Ok(())
}

struct LoadStage {
    loaders: Arc<LoaderRegistry>,
    relational: Arc<dyn RelationalStore>,
}

#[async_trait::async_trait]
impl Stage for LoadStage {
    fn name(&self) -> &'static str {
        "load"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Stream
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let sources = match input {
            StageData::Sources(sources) => sources,
            other => return Err(other.type_mismatch("load", "sources")),
        };
        let total = sources.len();
        let mut documents = Vec::with_capacity(total);
        let mut report_warnings = Vec::new();
        let mut failed = 0u64;

        for source in sources {
            if ctx.cancel.is_cancelled() {
                return Err(NoemaError::Cancelled);
            }
            match self.load_one(&source, ctx).await {
                Ok(doc) => {
                    self.relational
                        .set_pipeline_status(source.data.id, PipelineStatus::Running)
                        .await?;
                    documents.push(doc);
                }
                Err(e) => {
                    warn!(data_id = %source.data.id, error = %e, "document failed to load");
                    failed += 1;
                    let _ = self
                        .relational
                        .set_pipeline_status(source.data.id, PipelineStatus::Failed)
                        .await;
                    report_warnings.push(format!(
                        "document {} could not be loaded: {e}",
                        source.data.source_path
                    ));
                }
            }
        }

        if total > 0 && documents.is_empty() {
            return Err(NoemaError::Validation(
                "no document in the batch could be loaded".to_string(),
            ));
        }

        let mut report = StageReport::new(StageData::Documents(documents));
        report.dropped = failed;
        report.warnings = report_warnings;
        Ok(report)
    }
}

impl LoadStage {
    async fn load_one(
        &self,
        source: &DocumentSource,
        ctx: &RunContext,
    ) -> Result<ChunkableDocument> {
        let loader = self
            .loaders
            .resolve(source.raw.extension(), &source.raw.mime)
            .ok_or_else(|| {
                NoemaError::Validation(format!(
                    "no loader supports {} ({})",
                    source.data.source_path, source.data.mime
                ))
            })?;
        let loaded = loader.load(&source.raw).await?;
        Ok(ChunkableDocument {
            data_id: source.data.id,
            dataset_id: ctx.dataset_id,
            tenant_id: ctx.tenant_id,
            source_path: Some(source.data.source_path.clone()),
            text: loaded.text,
            blocks: loaded.blocks,
        })
    }
}

struct ChunkStage {
    tokenizer: Arc<dyn TokenEstimator>,
    max_tokens: usize,
    overlap: usize,
}

#[async_trait::async_trait]
impl Stage for ChunkStage {
    fn name(&self) -> &'static str {
        "chunk"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Stream
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let documents = match input {
            StageData::Documents(documents) => documents,
            other => return Err(other.type_mismatch("chunk", "documents")),
        };
        let chunker = TextChunker::new(self.tokenizer.as_ref(), self.max_tokens, self.overlap);
        let mut chunks: Vec<DocumentChunk> = Vec::new();
        for document in &documents {
            if ctx.cancel.is_cancelled() {
                return Err(NoemaError::Cancelled);
            }
            chunks.extend(chunker.split(document));
        }
        Ok(StageReport::new(StageData::Chunks(chunks)))
    }
}

struct ExtractStage {
    extractor: Arc<GraphExtractor>,
}

#[async_trait::async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        "extract"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::ParallelStream
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let chunks = match input {
            StageData::Chunks(chunks) => chunks,
            other => return Err(other.type_mismatch("extract", "chunks")),
        };

        let extractor = self.extractor.clone();
        let cancel = ctx.cancel.clone();
        let graphs = run_parallel(chunks.clone(), ctx.workers, &ctx.cancel, move |chunk| {
            let extractor = extractor.clone();
            let cancel = cancel.clone();
            async move { extractor.extract(&chunk, &cancel).await }
        })
        .await?;

        let retries: u64 = graphs.iter().map(|g| g.retries).sum();
        let dropped: u64 = graphs
            .iter()
            .map(|g| g.dangling_dropped + g.ontology_dropped)
            .sum();
        let low_yield = graphs.iter().filter(|g| g.low_yield).count();
        if low_yield > 0 {
            info!(low_yield, total = graphs.len(), "chunks yielded no entities");
        }

        let mut report = StageReport::new(StageData::Extractions { chunks, graphs });
        report.retries = retries;
        report.dropped = dropped;
        Ok(report)
    }
}

struct DistillStage {
    distiller: Arc<KnowledgeDistiller>,
    writer: Arc<GraphVectorWriter>,
}

#[async_trait::async_trait]
impl Stage for DistillStage {
    fn name(&self) -> &'static str {
        "distill"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Value
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let (chunks, graphs) = match input {
            StageData::Extractions { chunks, graphs } => (chunks, graphs),
            other => return Err(other.type_mismatch("distill", "extractions")),
        };

        let outcome = self.distiller.distill(&chunks, &ctx.cancel).await?;
        if !outcome.items.is_empty() {
            let projections: Vec<&dyn GraphProjection> = outcome
                .items
                .iter()
                .map(|d| d as &dyn GraphProjection)
                .collect();
            self.writer.write(&projections, &ctx.cancel).await?;
        }

        let mut report = StageReport::new(StageData::Extractions { chunks, graphs });
        report.warnings = outcome.warnings;
        report.items_out_override = Some(outcome.items.len() as u64);
        Ok(report)
    }
}

struct ValidateStage {
    validator: Arc<RelationValidator>,
}

#[async_trait::async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Value
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let (chunks, mut graphs) = match input {
            StageData::Extractions { chunks, graphs } => (chunks, graphs),
            other => return Err(other.type_mismatch("validate", "extractions")),
        };

        let chunk_texts: HashMap<Uuid, String> =
            chunks.iter().map(|c| (c.id, c.text.clone())).collect();
        let all_relations: Vec<Relation> = graphs
            .iter_mut()
            .flat_map(|g| std::mem::take(&mut g.relations))
            .collect();

        let outcome = self
            .validator
            .validate(all_relations, &chunk_texts, &ctx.cancel)
            .await?;

        // Hand surviving relations back to their chunk graphs.
        for relation in outcome.relations {
            if let Some(graph) = graphs
                .iter_mut()
                .find(|g| g.chunk_id == relation.source_chunk_id)
            {
                graph.relations.push(relation);
            }
        }

        let mut report = StageReport::new(StageData::Extractions { chunks, graphs });
        report.dropped = outcome.dropped;
        if outcome.degraded {
            report
                .warnings
                .push("relation validation unavailable; default scores applied".to_string());
        }
        Ok(report)
    }
}

struct ResolveStage {
    resolver: Arc<EntityResolver>,
    relational: Arc<dyn RelationalStore>,
    enabled: bool,
}

#[async_trait::async_trait]
impl Stage for ResolveStage {
    fn name(&self) -> &'static str {
        "resolve"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Value
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let (chunks, graphs) = match input {
            StageData::Extractions { chunks, graphs } => (chunks, graphs),
            other => return Err(other.type_mismatch("resolve", "extractions")),
        };

        let mut entities = Vec::new();
        let mut relations = Vec::new();
        for graph in graphs {
            entities.extend(graph.entities);
            relations.extend(graph.relations);
        }

        let (entities, alias_of, merged) = if self.enabled {
            let outcome = self.resolver.resolve(entities).await?;
            (outcome.entities, outcome.alias_of, outcome.merged)
        } else {
            (collapse_identical(entities), Vec::new(), 0)
        };

        if !alias_of.is_empty() {
            self.relational
                .record_aliases(ctx.tenant_id, &alias_of)
                .await?;
        }

        // Remap relation endpoints onto canonical entities; merges can
        // collapse a relation into a self-loop, which is dropped.
        let remap: HashMap<Uuid, Uuid> = alias_of.iter().copied().collect();
        let mut deduped: Vec<Relation> = Vec::new();
        let mut slots: HashMap<(Uuid, Uuid, String), usize> = HashMap::new();
        let mut self_loops = 0u64;
        for mut relation in relations {
            if let Some(&canonical) = remap.get(&relation.source_id) {
                relation.source_id = canonical;
            }
            if let Some(&canonical) = remap.get(&relation.target_id) {
                relation.target_id = canonical;
            }
            if relation.source_id == relation.target_id {
                self_loops += 1;
                continue;
            }
            let key = (
                relation.source_id,
                relation.target_id,
                relation.relation_type.clone(),
            );
            match slots.get(&key).copied() {
                Some(slot) => {
                    let existing = &mut deduped[slot];
                    existing.confidence = existing.confidence.max(relation.confidence);
                    existing.weight = existing.weight.max(relation.weight);
                }
                None => {
                    slots.insert(key, deduped.len());
                    deduped.push(relation);
                }
            }
        }

        let mut report = StageReport::new(StageData::Graph {
            chunks,
            entities,
            relations: deduped,
            alias_of,
        });
        report.dropped = merged + self_loops;
        Ok(report)
    }
}

/// Relations projected as graph edges only.
struct RelationSet(Vec<Relation>);

impl GraphProjection for RelationSet {
    fn nodes(&self) -> Vec<GraphNode> {
        Vec::new()
    }
    fn edges(&self) -> Vec<GraphEdge> {
        self.0.iter().map(Relation::to_graph_edge).collect()
    }
}

struct WriteStage {
    writer: Arc<GraphVectorWriter>,
    relational: Arc<dyn RelationalStore>,
}

#[async_trait::async_trait]
impl Stage for WriteStage {
    fn name(&self) -> &'static str {
        "write"
    }
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Value
    }

    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport> {
        let (chunks, entities, relations) = match input {
            StageData::Graph {
                chunks,
                entities,
                relations,
                ..
            } => (chunks, entities, relations),
            other => return Err(other.type_mismatch("write", "graph")),
        };

        let relation_set = RelationSet(relations);
        let mut projections: Vec<&dyn GraphProjection> = Vec::new();
        for chunk in &chunks {
            projections.push(chunk);
        }
        for entity in &entities {
            projections.push(entity);
        }
        projections.push(&relation_set);

        let write_report = self.writer.write(&projections, &ctx.cancel).await?;

        let data_ids: HashSet<Uuid> = chunks.iter().map(|c| c.data_id).collect();
        for data_id in data_ids {
            self.relational
                .set_pipeline_status(data_id, PipelineStatus::Completed)
                .await?;
        }

        let mut report = StageReport::new(StageData::Report(write_report));
        report.dropped = write_report.integrity_dropped;
        report.items_out_override = Some(write_report.items_written());
        Ok(report)
    }
}
