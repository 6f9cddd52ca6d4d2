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

//! Second-pass relation validation.
//!
//! A single scoring call judges every candidate relation against its source
//! text and relations below the threshold are dropped. When the validator
//! cannot run, every relation keeps the default score and nothing is
//! filtered; the run records the degradation and continues.

use crate::extract::Relation;
use crate::prompts::validation_prompt;
use noema_core::{NoemaConfig, NoemaError, Result, RetryPolicy, TokenBucket, ValidateConfig};
use noema_storage::{CompletionRequest, LanguageModel};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Validation result: surviving relations plus what happened.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub relations: Vec<Relation>,
    /// Relations removed for scoring below the threshold.
    pub dropped: u64,
    /// True when scoring was unavailable and defaults were applied.
    pub degraded: bool,
}

#[derive(Debug, Deserialize)]
struct WireScores {
    #[serde(default)]
    scores: Vec<WireScore>,
}

#[derive(Debug, Deserialize)]
struct WireScore {
    index: usize,
    confidence: f64,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

fn scores_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "scores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "index": {"type": "integer"},
                        "confidence": {"type": "number"},
                        "reason": {"type": "string"}
                    },
                    "required": ["index", "confidence"]
                }
            }
        },
        "required": ["scores"]
    })
}

/// Scores extracted relations with a secondary model call.
pub struct RelationValidator {
    llm: Option<Arc<dyn LanguageModel>>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    model: String,
    deadline: Duration,
    config: ValidateConfig,
}

impl RelationValidator {
    pub fn new(
        llm: Option<Arc<dyn LanguageModel>>,
        limiter: Arc<TokenBucket>,
        config: &NoemaConfig,
    ) -> Self {
        Self {
            llm,
            limiter,
            retry: RetryPolicy::with_max_attempts(config.extractor.max_retries),
            model: config.extractor.model.clone(),
            deadline: config.deadlines.llm,
            config: config.validate.clone(),
        }
    }

    /// Score and filter relations. `chunk_texts` maps chunk ids to their
    /// text so each candidate is judged against what it was extracted from.
    pub async fn validate(
        &self,
        relations: Vec<Relation>,
        chunk_texts: &HashMap<Uuid, String>,
        cancel: &CancellationToken,
    ) -> Result<ValidationOutcome> {
        if relations.is_empty() {
            return Ok(ValidationOutcome::default());
        }
        if cancel.is_cancelled() {
            return Err(NoemaError::Cancelled);
        }

        let Some(llm) = &self.llm else {
            return Ok(self.degrade(relations, "no validation model wired"));
        };

        let candidates: Vec<(usize, String, String, String, String)> = relations
            .iter()
            .enumerate()
            .map(|(i, r)| {
                (
                    i,
                    r.source_name.clone(),
                    r.relation_type.clone(),
                    r.target_name.clone(),
                    chunk_texts
                        .get(&r.source_chunk_id)
                        .cloned()
                        .unwrap_or_default(),
                )
            })
            .collect();

        let request = CompletionRequest::structured(
            self.model.clone(),
            validation_prompt(&candidates),
            scores_schema(),
            0.0,
            self.deadline,
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(NoemaError::Cancelled),
            outcome = self.retry.run(|| {
                let request = request.clone();
                async move {
                    self.limiter.acquire().await;
                    llm.structured_complete(&request).await.map_err(NoemaError::from)
                }
            }) => outcome,
        };

        let parsed: WireScores = match response {
            Ok(retried) => match serde_json::from_value(retried.value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    return Ok(self.degrade(relations, &format!("unparseable scores: {e}")));
                }
            },
            Err(NoemaError::Cancelled) => return Err(NoemaError::Cancelled),
            Err(e) => {
                return Ok(self.degrade(relations, &e.to_string()));
            }
        };

        let mut score_map: HashMap<usize, f64> = HashMap::new();
        for score in parsed.scores {
            score_map.insert(score.index, score.confidence.clamp(0.0, 1.0));
        }

        let total = relations.len();
        let mut retained = Vec::with_capacity(total);
        let mut dropped = 0u64;
        for (i, mut relation) in relations.into_iter().enumerate() {
            let confidence = score_map
                .get(&i)
                .copied()
                .unwrap_or(self.config.default_confidence);
            relation.confidence = confidence;
            if confidence >= self.config.threshold {
                retained.push(relation);
            } else {
                dropped += 1;
            }
        }

        info!(
            input = total,
            retained = retained.len(),
            dropped,
            threshold = self.config.threshold,
            "relation validation complete"
        );
        Ok(ValidationOutcome {
            relations: retained,
            dropped,
            degraded: false,
        })
    }

    /// Keep everything at the default score; the threshold is skipped.
    fn degrade(&self, mut relations: Vec<Relation>, reason: &str) -> ValidationOutcome {
        warn!(
            reason,
            default = self.config.default_confidence,
            "relation validation unavailable, applying default scores"
        );
        for relation in &mut relations {
            relation.confidence = self.config.default_confidence;
        }
        ValidationOutcome {
            relations,
            dropped: 0,
            degraded: true,
        }
    }
}
