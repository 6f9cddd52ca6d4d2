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

//! Engine configuration.
//!
//! Every tunable the pipeline and retrievers consume lives here, with the
//! production defaults inline. The launching layer deserializes overrides
//! into this tree; components only ever read it through a shared reference.

use crate::ontology::Ontology;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NoemaConfig {
    pub chunk: ChunkConfig,
    pub extractor: ExtractorConfig,
    pub resolve: ResolveConfig,
    pub validate: ValidateConfig,
    pub retrieve: RetrieveConfig,
    pub workers: WorkerConfig,
    pub embed: EmbedConfig,
    pub deadlines: DeadlineConfig,
    /// Optional domain ontology constraining extraction.
    pub ontology: Ontology,
}

/// Chunking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Maximum tokens per chunk.
    pub size: usize,
    /// Token overlap between consecutive chunks.
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 512,
            overlap: 50,
        }
    }
}

/// Graph-extraction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Model identifier passed through to the language-model port.
    pub model: String,
    /// Sampling temperature. Extraction runs deterministic.
    pub temperature: f32,
    /// Retry budget for transient/rate-limited calls.
    pub max_retries: u32,
    /// Re-ask budget when the response violates the JSON schema.
    pub max_parse_retries: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_retries: 5,
            max_parse_retries: 2,
        }
    }
}

/// Entity-resolution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Levenshtein similarity at or above which same-type entities merge.
    pub fuzzy_threshold: f64,
    /// Cosine similarity at or above which the embedding pass merges a pair
    /// whose fuzzy score landed in the ambiguous band.
    pub embedding_threshold: f64,
    /// Lower bound of the ambiguous fuzzy band that goes to embeddings.
    pub embedding_band_floor: f64,
    /// Above this many candidates the fuzzy pass blocks by name prefix
    /// instead of comparing all pairs.
    pub blocking_limit: usize,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            embedding_threshold: 0.90,
            embedding_band_floor: 0.6,
            blocking_limit: 10_000,
        }
    }
}

/// Relation-validation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateConfig {
    /// Relations scoring below this confidence are dropped.
    pub threshold: f64,
    /// Score assigned to every relation when the validator is unavailable;
    /// the threshold is skipped in that case.
    pub default_confidence: f64,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            default_confidence: 0.5,
        }
    }
}

/// Retrieval parameters shared by the three strategies and the fusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    pub top_k: usize,
    /// Individual vector hits below this similarity are discarded.
    pub similarity_threshold: f32,
    /// Hybrid fusion weights; normalized at use if they do not sum to 1.
    pub weights: HybridWeights,
    /// Reciprocal-rank-fusion constant.
    pub rrf_k: u32,
    /// Whether the cross-encoder rerank step runs when a backend is wired.
    pub rerank_enabled: bool,
    /// Graph traversal depth from each seed entity.
    pub graph_depth: usize,
    /// Maximum BFS frontier during triplet collection.
    pub max_frontier: usize,
    /// Relevance floor for graph triplets after ranking; 0 disables.
    pub min_quality: f64,
    /// Whether the type-balanced diversity cap runs on triplet results.
    pub diversity_enabled: bool,
    /// Sampling temperature for grounded answer generation.
    pub answer_temperature: f32,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_threshold: 0.7,
            weights: HybridWeights::default(),
            rrf_k: 60,
            rerank_enabled: false,
            graph_depth: 2,
            max_frontier: 50,
            min_quality: 0.6,
            diversity_enabled: true,
            answer_temperature: 0.3,
        }
    }
}

/// Per-strategy weights for reciprocal rank fusion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub vector: f64,
    pub graph: f64,
    pub lexical: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.4,
            graph: 0.3,
            lexical: 0.3,
        }
    }
}

impl HybridWeights {
    /// Weights scaled to sum to 1.0. Falls back to equal weights when the
    /// configured values sum to zero.
    pub fn normalized(&self) -> Self {
        let total = self.vector + self.graph + self.lexical;
        if total <= f64::EPSILON {
            return Self {
                vector: 1.0 / 3.0,
                graph: 1.0 / 3.0,
                lexical: 1.0 / 3.0,
            };
        }
        Self {
            vector: self.vector / total,
            graph: self.graph / total,
            lexical: self.lexical / total,
        }
    }
}

/// Worker-pool sizing for parallel pipeline stages and CPU-bound passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool: 8 }
    }
}

impl WorkerConfig {
    /// Effective pool size, never exceeding the host's parallelism.
    pub fn effective_pool(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(self.pool);
        self.pool.min(cpus).max(1)
    }
}

/// Embedding batch parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub batch: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self { batch: 32 }
    }
}

/// Deadlines applied to every external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    pub llm: Duration,
    pub embed: Duration,
    pub db: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            llm: Duration::from_secs(60),
            embed: Duration::from_secs(30),
            db: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let cfg = NoemaConfig::default();
        assert_eq!(cfg.chunk.size, 512);
        assert_eq!(cfg.chunk.overlap, 50);
        assert_eq!(cfg.extractor.temperature, 0.0);
        assert_eq!(cfg.extractor.max_retries, 5);
        assert_eq!(cfg.resolve.fuzzy_threshold, 0.85);
        assert_eq!(cfg.resolve.embedding_threshold, 0.90);
        assert_eq!(cfg.validate.threshold, 0.7);
        assert_eq!(cfg.retrieve.top_k, 10);
        assert_eq!(cfg.retrieve.rrf_k, 60);
        assert_eq!(cfg.retrieve.min_quality, 0.6);
        assert!(cfg.retrieve.diversity_enabled);
        assert_eq!(cfg.workers.pool, 8);
        assert_eq!(cfg.embed.batch, 32);
        assert_eq!(cfg.deadlines.llm, Duration::from_secs(60));
        assert!(!cfg.ontology.enabled);
    }

    #[test]
    fn weight_normalization() {
        let w = HybridWeights {
            vector: 2.0,
            graph: 1.0,
            lexical: 1.0,
        }
        .normalized();
        assert!((w.vector - 0.5).abs() < 1e-9);
        assert!((w.graph - 0.25).abs() < 1e-9);

        let zero = HybridWeights {
            vector: 0.0,
            graph: 0.0,
            lexical: 0.0,
        }
        .normalized();
        assert!((zero.vector - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let cfg: NoemaConfig = serde_json::from_str(r#"{"chunk":{"size":256}}"#).unwrap();
        assert_eq!(cfg.chunk.size, 256);
        assert_eq!(cfg.chunk.overlap, 50);
        assert_eq!(cfg.retrieve.top_k, 10);
    }
}
