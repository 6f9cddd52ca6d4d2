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

//! Noema Storage
//!
//! Port traits for the relational, graph and vector stores, the language
//! model, the embedder and the document loaders, together with in-memory
//! reference adapters. Real drivers implement these traits outside the
//! engine; everything in the pipeline and retrieval layers is written
//! against the ports alone.

pub mod embedder;
pub mod graph;
pub mod llm;
pub mod loader;
pub mod relational;
pub mod vector;

pub use embedder::{deterministic_embedding, Embedder, HashEmbedder};
pub use graph::{GraphStore, InMemoryGraphStore};
pub use llm::{
    CompletionError, CompletionRequest, LanguageModel, RecordedCall, ScriptedLanguageModel,
};
pub use loader::{LoadedDocument, Loader, LoaderRegistry, PlainTextLoader, RawDocument, TextBlock};
pub use relational::{
    DataRecord, DatasetRecord, InMemoryRelationalStore, PipelineRunRecord, PipelineStatus,
    RelationalStore, RunFailure, RunStatus, StageProgress,
};
pub use vector::{
    collection_name, cosine_similarity, InMemoryVectorStore, PayloadFilter, ScoredPoint,
    VectorPoint, VectorStore,
};
