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

//! Run progress events and the per-run broadcast fan-out.
//!
//! One producer (the pipeline engine) and any number of subscribers per run.
//! The channel is lossy: a subscriber that falls behind loses the oldest
//! events rather than blocking the engine.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffered events per run before drop-oldest kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// Per-stage throughput counters, reported on stage completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub items_in: u64,
    pub items_out: u64,
    pub duration_ms: u64,
    pub retries: u64,
    /// Items discarded by design (dangling edges, sub-threshold relations).
    pub dropped: u64,
}

/// Everything a subscriber can observe about a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        dataset_id: Uuid,
    },
    StageStarted {
        run_id: Uuid,
        stage: String,
    },
    StageCompleted {
        run_id: Uuid,
        stage: String,
        counters: StageCounters,
    },
    RunCompleted {
        run_id: Uuid,
        /// Degradation warnings accumulated during the run.
        warnings: Vec<String>,
    },
    RunFailed {
        run_id: Uuid,
        stage: String,
        kind: String,
        message: String,
        retryable: bool,
    },
    RunCancelled {
        run_id: Uuid,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageCompleted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id } => *run_id,
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

/// Process-wide registry of per-run broadcast channels.
#[derive(Default)]
pub struct EventBus {
    channels: DashMap<Uuid, broadcast::Sender<RunEvent>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to a run's events. The channel is created on first use so
    /// subscribers may attach before the run starts.
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<RunEvent> {
        self.sender(run_id).subscribe()
    }

    /// Publish an event. Send failures only mean nobody is listening.
    pub fn publish(&self, event: RunEvent) {
        let run_id = event.run_id();
        let terminal = event.is_terminal();
        let _ = self.sender(run_id).send(event);
        if terminal {
            // Drop the sender so receivers observe channel close after
            // draining; late subscribers get a fresh, already-closed run.
            self.channels.remove(&run_id);
        }
    }

    fn sender(&self, run_id: Uuid) -> broadcast::Sender<RunEvent> {
        self.channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}
