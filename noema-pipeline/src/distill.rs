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

//! Cross-chunk knowledge distillation.
//!
//! Groups a document's chunks and asks the model for aggregate statements
//! (enumerations, rollups, disambiguations, negations, Q&A pairs) that no
//! single chunk states on its own. Oversized documents are distilled in
//! batches and merged in a second pass. Distillations are indexed data
//! points; a failure here degrades the run, never fails it.

use crate::chunk::DocumentChunk;
use crate::prompts::distillation_prompt;
use noema_core::{
    GraphEdge, GraphNode, GraphProjection, NoemaConfig, NoemaError, Result, RetryPolicy,
    TokenBucket, NODE_DISTILLATION,
};
use noema_storage::{CompletionRequest, LanguageModel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Distillation categories the model may emit.
const VALID_KINDS: &[&str] = &["enumeration", "aggregation", "disambiguation", "negation", "qa"];

/// Conservative per-call text budget (~6k tokens at 4 chars each).
const CONTEXT_CHAR_LIMIT: usize = 24_000;

/// One distilled statement, stored and vector-indexed like any data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distillation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub dataset_id: Uuid,
    pub data_id: Uuid,
    pub kind: String,
    pub text: String,
}

impl GraphProjection for Distillation {
    fn nodes(&self) -> Vec<GraphNode> {
        vec![
            GraphNode::new(self.id, NODE_DISTILLATION, self.tenant_id, self.dataset_id)
                .with_source(self.data_id, None)
                .with_property("text", self.text.clone())
                .with_property("kind", self.kind.clone())
                .with_index_fields(&["text"]),
        ]
    }

    fn edges(&self) -> Vec<GraphEdge> {
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
struct WireItems {
    #[serde(default)]
    items: Vec<WireItem>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

fn items_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": {"type": "string"},
                        "text": {"type": "string"}
                    },
                    "required": ["type", "text"]
                }
            }
        },
        "required": ["items"]
    })
}

/// Per-document distiller.
pub struct KnowledgeDistiller {
    llm: Arc<dyn LanguageModel>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    model: String,
    deadline: Duration,
}

/// Distillations plus per-document failures (degradations, not errors).
#[derive(Debug, Default)]
pub struct DistillationOutcome {
    pub items: Vec<Distillation>,
    pub warnings: Vec<String>,
}

impl KnowledgeDistiller {
    pub fn new(llm: Arc<dyn LanguageModel>, limiter: Arc<TokenBucket>, config: &NoemaConfig) -> Self {
        Self {
            llm,
            limiter,
            retry: RetryPolicy::with_max_attempts(config.extractor.max_retries),
            model: config.extractor.model.clone(),
            deadline: config.deadlines.llm,
        }
    }

    /// Distill every document present in `chunks`.
    pub async fn distill(
        &self,
        chunks: &[DocumentChunk],
        cancel: &CancellationToken,
    ) -> Result<DistillationOutcome> {
        let mut outcome = DistillationOutcome::default();
        if chunks.is_empty() {
            return Ok(outcome);
        }

        // Group by document, ordered for determinism.
        let mut by_doc: BTreeMap<Uuid, Vec<&DocumentChunk>> = BTreeMap::new();
        for chunk in chunks {
            by_doc.entry(chunk.data_id).or_default().push(chunk);
        }

        for (data_id, mut doc_chunks) in by_doc {
            if cancel.is_cancelled() {
                return Err(NoemaError::Cancelled);
            }
            doc_chunks.sort_by_key(|c| c.chunk_index);
            let tenant_id = doc_chunks[0].tenant_id;
            let dataset_id = doc_chunks[0].dataset_id;

            match self.distill_document(&doc_chunks, cancel).await {
                Ok(items) => {
                    for (index, (kind, text)) in items.into_iter().enumerate() {
                        outcome.items.push(Distillation {
                            id: noema_core::id::derived_id(data_id, "distillation", index),
                            tenant_id,
                            dataset_id,
                            data_id,
                            kind,
                            text,
                        });
                    }
                }
                Err(NoemaError::Cancelled) => return Err(NoemaError::Cancelled),
                Err(e) => {
                    warn!(data_id = %data_id, error = %e, "distillation failed for document");
                    outcome
                        .warnings
                        .push(format!("distillation unavailable for document {data_id}: {e}"));
                }
            }
        }

        info!(
            items = outcome.items.len(),
            degraded_docs = outcome.warnings.len(),
            "knowledge distillation complete"
        );
        Ok(outcome)
    }

    /// Map-reduce over one document: batch when the combined text exceeds
    /// the context budget, then merge batch outputs in a final pass.
    async fn distill_document(
        &self,
        chunks: &[&DocumentChunk],
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, String)>> {
        let combined: String = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        if combined.len() <= CONTEXT_CHAR_LIMIT {
            return self.call(&combined, cancel).await;
        }

        let mut batch_items: Vec<(String, String)> = Vec::new();
        let mut batch = String::new();
        for chunk in chunks {
            if !batch.is_empty() && batch.len() + chunk.text.len() + 2 > CONTEXT_CHAR_LIMIT {
                batch_items.extend(self.call(&batch, cancel).await?);
                batch.clear();
            }
            if !batch.is_empty() {
                batch.push_str("\n\n");
            }
            batch.push_str(&chunk.text);
        }
        if !batch.is_empty() {
            batch_items.extend(self.call(&batch, cancel).await?);
        }

        let merge_text: String = batch_items
            .iter()
            .map(|(kind, text)| format!("[{}] {}", kind.to_uppercase(), text))
            .collect::<Vec<_>>()
            .join("\n\n");
        if merge_text.len() <= CONTEXT_CHAR_LIMIT {
            self.call(&merge_text, cancel).await
        } else {
            warn!("merge pass over context budget, keeping unmerged batch output");
            Ok(batch_items)
        }
    }

    async fn call(
        &self,
        document_text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, String)>> {
        let request = CompletionRequest::structured(
            self.model.clone(),
            distillation_prompt(document_text),
            items_schema(),
            0.0,
            self.deadline,
        );

        let value = tokio::select! {
            _ = cancel.cancelled() => return Err(NoemaError::Cancelled),
            outcome = self.retry.run(|| {
                let request = request.clone();
                async move {
                    self.limiter.acquire().await;
                    self.llm.structured_complete(&request).await.map_err(NoemaError::from)
                }
            }) => outcome?.value,
        };

        let parsed: WireItems = serde_json::from_value(value)
            .map_err(|e| NoemaError::permanent(format!("unparseable distillation items: {e}")))?;

        Ok(parsed
            .items
            .into_iter()
            .filter_map(|item| {
                let kind = item.kind.trim().to_lowercase();
                let text = item.text.trim().to_string();
                if VALID_KINDS.contains(&kind.as_str()) && !text.is_empty() {
                    Some((kind, text))
                } else {
                    if !kind.is_empty() {
                        warn!(kind = %kind, "skipping unknown distillation kind");
                    }
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CutType;
    use noema_core::LimiterConfig;
    use noema_storage::{CompletionError, ScriptedLanguageModel};

    fn chunk(data_id: Uuid, index: usize, text: &str) -> DocumentChunk {
        DocumentChunk {
            id: Uuid::new_v4(),
            data_id,
            dataset_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            text: text.to_string(),
            chunk_index: index,
            token_count: 10,
            start_line: 1,
            end_line: 1,
            start_char: 0,
            end_char: text.len(),
            page_number: None,
            cut_type: CutType::EndOfText,
            source_path: None,
        }
    }

    fn distiller(llm: Arc<ScriptedLanguageModel>) -> KnowledgeDistiller {
        let limiter = Arc::new(TokenBucket::new(LimiterConfig {
            rate_per_sec: 10_000.0,
            burst: 10_000.0,
        }));
        KnowledgeDistiller::new(llm, limiter, &NoemaConfig::default())
    }

    #[tokio::test]
    async fn distills_valid_items_with_stable_ids() {
        let llm = Arc::new(ScriptedLanguageModel::new());
        llm.set_default_structured(json!({
            "items": [
                {"type": "enumeration", "text": "The offices are Berlin and Paris."},
                {"type": "martian", "text": "ignored"},
                {"type": "qa", "text": "Q: Where is Acme based? A: Berlin."}
            ]
        }));
        let data_id = Uuid::new_v4();
        let chunks = vec![chunk(data_id, 0, "Acme has offices."), chunk(data_id, 1, "Berlin and Paris.")];

        let out = distiller(llm.clone()).distill(&chunks, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.items.len(), 2);
        assert!(out.warnings.is_empty());
        assert_eq!(out.items[0].kind, "enumeration");
        assert_eq!(
            out.items[0].id,
            noema_core::id::derived_id(data_id, "distillation", 0)
        );
        // One call for the single document.
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn failures_degrade_per_document() {
        let llm = Arc::new(ScriptedLanguageModel::new());
        llm.push_error(CompletionError::Permanent("model offline".into()));
        let chunks = vec![chunk(Uuid::new_v4(), 0, "Some text.")];

        let out = distiller(llm).distill(&chunks, &CancellationToken::new()).await.unwrap();
        assert!(out.items.is_empty());
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn empty_chunk_list_is_a_no_op() {
        let llm = Arc::new(ScriptedLanguageModel::new());
        let out = distiller(llm.clone()).distill(&[], &CancellationToken::new()).await.unwrap();
        assert!(out.items.is_empty());
        assert_eq!(llm.call_count(), 0);
    }
}
