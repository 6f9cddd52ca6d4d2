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

//! Pipeline engine.
//!
//! Runs a declared list of stages strictly in order, feeding each stage the
//! previous stage's output. The engine owns run-row persistence, progress
//! events, counters and cancellation; stages own their per-item failure
//! policy. Any error a stage lets escape is fatal for the run.

use crate::chunk::{ChunkableDocument, DocumentChunk, DocumentSource};
use crate::extract::{ChunkGraph, Entity, Relation};
use crate::write::WriteReport;
use futures::stream::{self, StreamExt};
use noema_core::{EventBus, NoemaError, Result, RunEvent, StageCounters};
use noema_storage::{
    PipelineRunRecord, RelationalStore, RunFailure, RunStatus, StageProgress,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a stage consumes its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Whole payload at once.
    Value,
    /// Element-at-a-time, in order.
    Stream,
    /// Element-at-a-time on a bounded worker pool, outputs unordered.
    ParallelStream,
}

/// Typed payload flowing between stages.
#[derive(Debug, Clone)]
pub enum StageData {
    Sources(Vec<DocumentSource>),
    Documents(Vec<ChunkableDocument>),
    Chunks(Vec<DocumentChunk>),
    Extractions {
        chunks: Vec<DocumentChunk>,
        graphs: Vec<ChunkGraph>,
    },
    Graph {
        chunks: Vec<DocumentChunk>,
        entities: Vec<Entity>,
        relations: Vec<Relation>,
        alias_of: Vec<(Uuid, Uuid)>,
    },
    Report(WriteReport),
}

impl StageData {
    /// Item count for stage counters.
    pub fn len(&self) -> usize {
        match self {
            Self::Sources(s) => s.len(),
            Self::Documents(d) => d.len(),
            Self::Chunks(c) => c.len(),
            Self::Extractions { graphs, .. } => graphs.len(),
            Self::Graph {
                entities, relations, ..
            } => entities.len() + relations.len(),
            Self::Report(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sources(_) => "sources",
            Self::Documents(_) => "documents",
            Self::Chunks(_) => "chunks",
            Self::Extractions { .. } => "extractions",
            Self::Graph { .. } => "graph",
            Self::Report(_) => "report",
        }
    }

    /// The standard error for a stage wired after the wrong predecessor.
    pub fn type_mismatch(&self, stage: &str, expected: &'static str) -> NoemaError {
        NoemaError::Validation(format!(
            "stage {stage} expected {expected} input, got {}",
            self.kind()
        ))
    }
}

/// What a stage hands back to the engine.
pub struct StageReport {
    pub data: StageData,
    pub retries: u64,
    pub dropped: u64,
    pub warnings: Vec<String>,
    /// Overrides the default items-out counter (payload length) for
    /// stages whose meaningful count is something else, e.g. the writer's
    /// actually-written item total.
    pub items_out_override: Option<u64>,
}

impl StageReport {
    pub fn new(data: StageData) -> Self {
        Self {
            data,
            retries: 0,
            dropped: 0,
            warnings: Vec::new(),
            items_out_override: None,
        }
    }
}

/// Shared context for one run.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub dataset_id: Uuid,
    pub user_id: Uuid,
    pub cancel: CancellationToken,
    /// Bounded pool size for parallel stages.
    pub workers: usize,
}

/// One pipeline stage.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn mode(&self) -> ExecutionMode;
    async fn run(&self, input: StageData, ctx: &RunContext) -> Result<StageReport>;
}

/// Apply `f` to every item concurrently on a bounded pool. Outputs arrive
/// in completion order. The first error wins and remaining work is
/// abandoned at the next suspension point.
pub async fn run_parallel<T, U, F, Fut>(
    items: Vec<T>,
    limit: usize,
    cancel: &CancellationToken,
    f: F,
) -> Result<Vec<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<U>> + Send,
{
    let limit = limit.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut stream = stream::iter(items.into_iter().map(|item| {
        let cancel = cancel.clone();
        let fut = f(item);
        async move {
            if cancel.is_cancelled() {
                return Err(NoemaError::Cancelled);
            }
            fut.await
        }
    }))
    .buffer_unordered(limit);

    while let Some(result) = stream.next().await {
        results.push(result?);
    }
    Ok(results)
}

/// Executes stage lists and owns run bookkeeping.
pub struct PipelineEngine {
    relational: Arc<dyn RelationalStore>,
    events: Arc<EventBus>,
}

impl PipelineEngine {
    pub fn new(relational: Arc<dyn RelationalStore>, events: Arc<EventBus>) -> Self {
        Self { relational, events }
    }

    /// Run `stages` over `seed`, updating the already-persisted run row as
    /// progress is made. Always returns the final run record; failures are
    /// recorded on it rather than bubbled, so callers can't lose the run
    /// id they already handed out.
    pub async fn run(
        &self,
        mut run: PipelineRunRecord,
        stages: &[Box<dyn Stage>],
        seed: StageData,
        ctx: &RunContext,
    ) -> Result<PipelineRunRecord> {
        self.events.publish(RunEvent::RunStarted {
            run_id: run.id,
            dataset_id: run.dataset_id,
        });

        let mut data = seed;
        let mut warnings: Vec<String> = Vec::new();

        for stage in stages {
            if ctx.cancel.is_cancelled() {
                return self.finish_cancelled(run, stage.name()).await;
            }

            let items_in = data.len() as u64;
            let started = Instant::now();
            self.events.publish(RunEvent::StageStarted {
                run_id: run.id,
                stage: stage.name().to_string(),
            });
            info!(run_id = %run.id, stage = stage.name(), mode = ?stage.mode(), items_in, "stage started");

            match stage.run(data, ctx).await {
                Ok(report) => {
                    let counters = StageCounters {
                        items_in,
                        items_out: report
                            .items_out_override
                            .unwrap_or(report.data.len() as u64),
                        duration_ms: started.elapsed().as_millis() as u64,
                        retries: report.retries,
                        dropped: report.dropped,
                    };
                    warnings.extend(report.warnings);
                    run.stages.push(StageProgress {
                        stage: stage.name().to_string(),
                        counters,
                    });
                    self.relational.update_run(run.clone()).await?;
                    self.events.publish(RunEvent::StageCompleted {
                        run_id: run.id,
                        stage: stage.name().to_string(),
                        counters,
                    });
                    data = report.data;
                }
                Err(NoemaError::Cancelled) => {
                    return self.finish_cancelled(run, stage.name()).await;
                }
                Err(err) => {
                    return self.finish_failed(run, stage.name(), err).await;
                }
            }
        }

        run.status = RunStatus::Completed;
        run.ended_at = Some(chrono::Utc::now());
        run.warnings = warnings.clone();
        self.relational.update_run(run.clone()).await?;
        self.events.publish(RunEvent::RunCompleted {
            run_id: run.id,
            warnings,
        });
        info!(run_id = %run.id, stages = run.stages.len(), "run completed");
        Ok(run)
    }

    async fn finish_cancelled(
        &self,
        mut run: PipelineRunRecord,
        stage: &str,
    ) -> Result<PipelineRunRecord> {
        warn!(run_id = %run.id, stage, "run cancelled");
        run.status = RunStatus::Cancelled;
        run.ended_at = Some(chrono::Utc::now());
        run.error = Some(RunFailure {
            stage: stage.to_string(),
            kind: NoemaError::Cancelled.kind().to_string(),
            message: "cancellation signal observed".to_string(),
            retryable: false,
        });
        self.relational.update_run(run.clone()).await?;
        self.events.publish(RunEvent::RunCancelled { run_id: run.id });
        Ok(run)
    }

    async fn finish_failed(
        &self,
        mut run: PipelineRunRecord,
        stage: &str,
        err: NoemaError,
    ) -> Result<PipelineRunRecord> {
        error!(run_id = %run.id, stage, error = %err, "run failed");
        run.status = RunStatus::Failed;
        run.ended_at = Some(chrono::Utc::now());
        run.error = Some(RunFailure {
            stage: stage.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        });
        self.relational.update_run(run.clone()).await?;
        self.events.publish(RunEvent::RunFailed {
            run_id: run.id,
            stage: stage.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        });
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noema_storage::InMemoryRelationalStore;

    struct CountingStage {
        name: &'static str,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Stage for CountingStage {
        fn name(&self) -> &'static str {
            self.name
        }
        fn mode(&self) -> ExecutionMode {
            ExecutionMode::Stream
        }
        async fn run(&self, input: StageData, _ctx: &RunContext) -> Result<StageReport> {
            if self.fail {
                return Err(NoemaError::permanent("stage blew up"));
            }
            let docs = match input {
                StageData::Documents(docs) => docs,
                other => return Err(other.type_mismatch(self.name, "documents")),
            };
            Ok(StageReport::new(StageData::Documents(docs)))
        }
    }

    fn ctx(run: &PipelineRunRecord) -> RunContext {
        RunContext {
            run_id: run.id,
            tenant_id: Uuid::new_v4(),
            dataset_id: run.dataset_id,
            user_id: run.user_id,
            cancel: CancellationToken::new(),
            workers: 4,
        }
    }

    async fn engine_with_run() -> (PipelineEngine, PipelineRunRecord, Arc<EventBus>) {
        let relational = Arc::new(InMemoryRelationalStore::new());
        let events = EventBus::new();
        let run = PipelineRunRecord::new(Uuid::new_v4(), Uuid::new_v4());
        relational.create_run(run.clone()).await.unwrap();
        (PipelineEngine::new(relational, events.clone()), run, events)
    }

    #[tokio::test]
    async fn stages_run_in_order_with_counters() {
        let (engine, run, events) = engine_with_run().await;
        let mut rx = events.subscribe(run.id);
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(CountingStage {
                name: "first",
                fail: false,
            }),
            Box::new(CountingStage {
                name: "second",
                fail: false,
            }),
        ];
        let context = ctx(&run);
        let seed = StageData::Documents(Vec::new());

        let done = engine.run(run, &stages, seed, &context).await.unwrap();

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.stages.len(), 2);
        assert_eq!(done.stages[0].stage, "first");
        assert_eq!(done.stages[1].stage, "second");
        assert!(done.ended_at.is_some());

        // RunStarted, 2x(StageStarted + StageCompleted), RunCompleted.
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                RunEvent::RunStarted { .. } => "run_started",
                RunEvent::StageStarted { .. } => "stage_started",
                RunEvent::StageCompleted { .. } => "stage_completed",
                RunEvent::RunCompleted { .. } => "run_completed",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "stage_started",
                "stage_completed",
                "stage_started",
                "stage_completed",
                "run_completed"
            ]
        );
    }

    #[tokio::test]
    async fn failing_stage_marks_run_failed() {
        let (engine, run, _) = engine_with_run().await;
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(CountingStage {
                name: "ok",
                fail: false,
            }),
            Box::new(CountingStage {
                name: "boom",
                fail: true,
            }),
        ];
        let context = ctx(&run);

        let done = engine
            .run(run, &stages, StageData::Documents(Vec::new()), &context)
            .await
            .unwrap();

        assert_eq!(done.status, RunStatus::Failed);
        let failure = done.error.unwrap();
        assert_eq!(failure.stage, "boom");
        assert_eq!(failure.kind, "permanent_backend");
        assert!(!failure.retryable);
        // Progress up to the failing stage is retained.
        assert_eq!(done.stages.len(), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_run_finishes_cancelled_without_running_stages() {
        let (engine, run, _) = engine_with_run().await;
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(CountingStage {
            name: "never",
            fail: false,
        })];
        let mut context = ctx(&run);
        context.cancel = CancellationToken::new();
        context.cancel.cancel();

        let done = engine
            .run(run, &stages, StageData::Documents(Vec::new()), &context)
            .await
            .unwrap();

        assert_eq!(done.status, RunStatus::Cancelled);
        assert!(done.stages.is_empty());
    }

    #[tokio::test]
    async fn run_parallel_bounds_concurrency_and_collects_all() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let live_ref = live.clone();
        let peak_ref = peak.clone();
        let out = run_parallel(
            (0..20).collect::<Vec<_>>(),
            4,
            &CancellationToken::new(),
            move |i| {
                let live = live_ref.clone();
                let peak = peak_ref.clone();
                async move {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                    Ok(i * 2)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(out.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        let mut sorted = out.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn run_parallel_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_parallel(vec![1, 2, 3], 2, &cancel, |i| async move { Ok(i) }).await;
        assert!(matches!(result, Err(NoemaError::Cancelled)));
    }
}
