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

//! Embedder port and the deterministic test embedder.

use async_trait::async_trait;

use crate::llm::CompletionError;

/// Port over the embedding provider. Batch-first: the writer always embeds
/// in batches, single texts are a batch of one.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, CompletionError>;

    fn dimension(&self) -> usize;
}

/// Deterministic embedder for tests: a seeded generator keyed by the text's
/// hash, normalized to unit length. Equal texts embed identically, distinct
/// texts land effectively orthogonal.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, CompletionError> {
        Ok(texts
            .iter()
            .map(|t| deterministic_embedding(t, self.dimension))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Unit-norm pseudo-embedding derived from the text's hash.
pub fn deterministic_embedding(text: &str, dimension: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    let seed = hasher.finish();

    let mut embedding = Vec::with_capacity(dimension);
    let mut state = seed;
    for _ in 0..dimension {
        state = state.wrapping_mul(0x5851f42d4c957f2d).wrapping_add(1);
        let val = (state as f32 / u64::MAX as f32) * 2.0 - 1.0;
        embedding.push(val);
    }

    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter_mut().for_each(|x| *x /= norm);
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn equal_texts_embed_identically() {
        let embedder = HashEmbedder::new(64);
        let out = embedder
            .embed(&["hello world".into(), "hello world".into()])
            .await
            .unwrap();
        assert_eq!(out[0], out[1]);
    }

    #[tokio::test]
    async fn distinct_texts_are_dissimilar() {
        let embedder = HashEmbedder::new(256);
        let out = embedder
            .embed(&["alpha".into(), "omega".into()])
            .await
            .unwrap();
        let sim = cosine_similarity(&out[0], &out[1]);
        assert!(sim.abs() < 0.5, "unexpectedly similar: {sim}");
    }

    #[test]
    fn embeddings_are_unit_norm() {
        let v = deterministic_embedding("anything", 128);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
