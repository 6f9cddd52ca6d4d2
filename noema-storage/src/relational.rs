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

//! Relational store port: datasets, ingested data and pipeline runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use noema_core::{NoemaError, Result, StageCounters};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing state of one ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Terminal and non-terminal states of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// A dataset row. `(tenant_id, name)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl DatasetRecord {
    pub fn new(tenant_id: Uuid, owner_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            owner_id,
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// An ingested document row. Content is immutable; `(tenant_id,
/// content_hash)` is unique and drives dedup on re-ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub dataset_ids: Vec<Uuid>,
    pub content_hash: String,
    pub mime: String,
    pub source_path: String,
    pub token_count: usize,
    pub pipeline_status: PipelineStatus,
}

/// Progress snapshot for one completed stage, persisted as JSON on the run
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: String,
    pub counters: StageCounters,
}

/// What a failed run exposes to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

/// One invocation of the ingestion pipeline over one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub user_id: Uuid,
    pub status: RunStatus,
    pub stages: Vec<StageProgress>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<RunFailure>,
    /// Degradations observed while still completing successfully.
    pub warnings: Vec<String>,
}

impl PipelineRunRecord {
    pub fn new(dataset_id: Uuid, user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            user_id,
            status: RunStatus::Running,
            stages: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            warnings: Vec::new(),
        }
    }
}

/// Port over the relational database.
///
/// Run-row updates are serialized per run id by the adapter; the engine is
/// the only writer for a live run.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn create_dataset(&self, dataset: DatasetRecord) -> Result<()>;
    async fn get_dataset(&self, tenant_id: Uuid, dataset_id: Uuid)
        -> Result<Option<DatasetRecord>>;
    async fn delete_dataset(&self, tenant_id: Uuid, dataset_id: Uuid) -> Result<()>;

    async fn persist_data(&self, data: DataRecord) -> Result<()>;
    /// Existing data id for this content hash within the tenant, if any.
    async fn dedup_data(&self, tenant_id: Uuid, content_hash: &str) -> Result<Option<Uuid>>;
    async fn list_data(&self, dataset_id: Uuid) -> Result<Vec<DataRecord>>;
    async fn set_pipeline_status(&self, data_id: Uuid, status: PipelineStatus) -> Result<()>;

    async fn create_run(&self, run: PipelineRunRecord) -> Result<()>;
    async fn update_run(&self, run: PipelineRunRecord) -> Result<()>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRunRecord>>;
    async fn list_runs(&self, dataset_id: Uuid) -> Result<Vec<PipelineRunRecord>>;

    /// Record that `alias_id` was merged into `canonical_id` during entity
    /// resolution, so stale references keep resolving.
    async fn record_aliases(&self, tenant_id: Uuid, aliases: &[(Uuid, Uuid)]) -> Result<()>;
    async fn resolve_alias(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Uuid>>;
}

/// In-memory reference adapter, complete enough for every end-to-end test.
#[derive(Default)]
pub struct InMemoryRelationalStore {
    datasets: DashMap<Uuid, DatasetRecord>,
    data: DashMap<Uuid, DataRecord>,
    content_index: DashMap<(Uuid, String), Uuid>,
    runs: DashMap<Uuid, PipelineRunRecord>,
    aliases: DashMap<(Uuid, Uuid), Uuid>,
}

impl InMemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    async fn create_dataset(&self, dataset: DatasetRecord) -> Result<()> {
        let duplicate_name = self
            .datasets
            .iter()
            .any(|d| d.tenant_id == dataset.tenant_id && d.name == dataset.name);
        if duplicate_name {
            return Err(NoemaError::Validation(format!(
                "dataset name already exists for tenant: {}",
                dataset.name
            )));
        }
        self.datasets.insert(dataset.id, dataset);
        Ok(())
    }

    async fn get_dataset(
        &self,
        tenant_id: Uuid,
        dataset_id: Uuid,
    ) -> Result<Option<DatasetRecord>> {
        Ok(self
            .datasets
            .get(&dataset_id)
            .filter(|d| d.tenant_id == tenant_id)
            .map(|d| d.clone()))
    }

    async fn delete_dataset(&self, tenant_id: Uuid, dataset_id: Uuid) -> Result<()> {
        let removed = self
            .datasets
            .remove_if(&dataset_id, |_, d| d.tenant_id == tenant_id);
        if removed.is_none() {
            return Err(NoemaError::NotFound {
                kind: "dataset",
                id: dataset_id.to_string(),
            });
        }
        // Cascade: drop data rows that belonged only to this dataset.
        let mut orphaned = Vec::new();
        for mut entry in self.data.iter_mut() {
            entry.dataset_ids.retain(|d| *d != dataset_id);
            if entry.dataset_ids.is_empty() {
                orphaned.push((entry.id, entry.tenant_id, entry.content_hash.clone()));
            }
        }
        for (id, tenant, hash) in orphaned {
            self.data.remove(&id);
            self.content_index.remove(&(tenant, hash));
        }
        Ok(())
    }

    async fn persist_data(&self, data: DataRecord) -> Result<()> {
        self.content_index
            .insert((data.tenant_id, data.content_hash.clone()), data.id);
        self.data.insert(data.id, data);
        Ok(())
    }

    async fn dedup_data(&self, tenant_id: Uuid, content_hash: &str) -> Result<Option<Uuid>> {
        Ok(self
            .content_index
            .get(&(tenant_id, content_hash.to_string()))
            .map(|id| *id))
    }

    async fn list_data(&self, dataset_id: Uuid) -> Result<Vec<DataRecord>> {
        let mut rows: Vec<DataRecord> = self
            .data
            .iter()
            .filter(|d| d.dataset_ids.contains(&dataset_id))
            .map(|d| d.clone())
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    async fn set_pipeline_status(&self, data_id: Uuid, status: PipelineStatus) -> Result<()> {
        match self.data.get_mut(&data_id) {
            Some(mut row) => {
                row.pipeline_status = status;
                Ok(())
            }
            None => Err(NoemaError::NotFound {
                kind: "data",
                id: data_id.to_string(),
            }),
        }
    }

    async fn create_run(&self, run: PipelineRunRecord) -> Result<()> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn update_run(&self, run: PipelineRunRecord) -> Result<()> {
        match self.runs.get_mut(&run.id) {
            Some(mut existing) => {
                *existing = run;
                Ok(())
            }
            None => Err(NoemaError::NotFound {
                kind: "pipeline_run",
                id: run.id.to_string(),
            }),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRunRecord>> {
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn list_runs(&self, dataset_id: Uuid) -> Result<Vec<PipelineRunRecord>> {
        let mut runs: Vec<PipelineRunRecord> = self
            .runs
            .iter()
            .filter(|r| r.dataset_id == dataset_id)
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn record_aliases(&self, tenant_id: Uuid, aliases: &[(Uuid, Uuid)]) -> Result<()> {
        for (alias_id, canonical_id) in aliases {
            self.aliases.insert((tenant_id, *alias_id), *canonical_id);
        }
        Ok(())
    }

    async fn resolve_alias(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.aliases.get(&(tenant_id, id)).map(|c| *c))
    }
}
