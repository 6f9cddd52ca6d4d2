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

//! Noema Core
//!
//! Shared foundation for the Noema knowledge engine: the error taxonomy,
//! deterministic identity, configuration, the data-point/graph-projection
//! model, run events, and resilience primitives.

pub mod config;
pub mod datapoint;
pub mod error;
pub mod event;
pub mod id;
pub mod ontology;
pub mod resilience;
pub mod token;

pub use config::{
    ChunkConfig, DeadlineConfig, EmbedConfig, ExtractorConfig, HybridWeights, NoemaConfig,
    ResolveConfig, RetrieveConfig, ValidateConfig, WorkerConfig,
};
pub use datapoint::{
    GraphEdge, GraphNode, GraphProjection, Provenance, EDGE_MENTIONS, NODE_CHUNK,
    NODE_DISTILLATION, NODE_ENTITY,
};
pub use error::{NoemaError, Result};
pub use event::{EventBus, RunEvent, StageCounters};
pub use ontology::{Ontology, OntologyType};
pub use resilience::{LimiterConfig, RateLimiterRegistry, Retried, RetryPolicy, TokenBucket};
pub use token::{HeuristicTokenizer, TokenEstimator};
