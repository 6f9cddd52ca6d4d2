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

//! Noema Pipeline
//!
//! The ingestion engine: documents are loaded, chunked with exact
//! provenance, run through LLM graph extraction, optionally validated and
//! distilled, entity-resolved, and written to the graph and vector stores.
//! Deterministic ids make every run an idempotent upsert over the same
//! artifacts.

pub mod chunk;
pub mod cognify;
pub mod distill;
pub mod engine;
pub mod extract;
pub mod prompts;
pub mod resolve;
pub mod validate;
pub mod write;

pub use chunk::{ChunkableDocument, CutType, DocumentChunk, DocumentSource, TextChunker};
pub use cognify::{ChunkerKind, CognifyDeps, CognifyOptions, CognifyRunner};
pub use distill::{Distillation, DistillationOutcome, KnowledgeDistiller};
pub use engine::{
    run_parallel, ExecutionMode, PipelineEngine, RunContext, Stage, StageData, StageReport,
};
pub use extract::{ChunkGraph, Entity, GraphExtractor, Relation};
pub use resolve::{
    collapse_identical, name_similarity, normalize_name, EntityResolver, ResolutionOutcome,
};
pub use validate::{RelationValidator, ValidationOutcome};
pub use write::{GraphVectorWriter, WriteReport};
