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

//! Grounded answer generation.
//!
//! The retrieved context is rendered as a numbered list with provenance
//! (file, page, line range) so the model can cite with `[n]` markers. With
//! no usable context the fixed fallback is returned without any model
//! call; the model's response is otherwise returned verbatim.

use crate::RetrievedItem;
use noema_core::{NoemaConfig, NoemaError, Provenance, Result, RetryPolicy, TokenBucket};
use noema_storage::{CompletionRequest, LanguageModel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Fixed answer when retrieval produced no usable context.
pub const NO_CONTEXT_ANSWER: &str =
    "I don't have enough information in the provided context to answer this question.";

/// Build the grounded answer prompt from numbered context sections.
fn answer_prompt(query: &str, numbered_context: &str) -> String {
    format!(
        r#"Answer the question using ONLY the context below.

## RULES
1. Cite sources with [n] markers matching the context numbering.
2. If the context does not contain the answer, reply exactly: "{NO_CONTEXT_ANSWER}"
3. Do not use outside knowledge.

## CONTEXT
{numbered_context}

## QUESTION
{query}

## ANSWER"#
    )
}

/// A citation entry mirroring the `[n]` markers in the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub index: usize,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// The generator's output: the verbatim answer, the rendered context, and
/// the citation table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub context: String,
    pub citations: Vec<Citation>,
}

/// Renders context and calls the model for a grounded completion.
pub struct AnswerGenerator {
    llm: Arc<dyn LanguageModel>,
    limiter: Arc<TokenBucket>,
    retry: RetryPolicy,
    model: String,
    temperature: f32,
    deadline: Duration,
}

impl AnswerGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, limiter: Arc<TokenBucket>, config: &NoemaConfig) -> Self {
        Self {
            llm,
            limiter,
            retry: RetryPolicy::with_max_attempts(config.extractor.max_retries),
            model: config.extractor.model.clone(),
            temperature: config.retrieve.answer_temperature,
            deadline: config.deadlines.llm,
        }
    }

    /// Render items as a numbered context block with provenance headers.
    pub fn format_context(items: &[RetrievedItem]) -> String {
        let mut out = String::new();
        for (i, item) in items.iter().enumerate() {
            let n = i + 1;
            match &item.provenance {
                Some(p) => {
                    let source = p.source_path.as_deref().unwrap_or("unknown source");
                    match p.page_number {
                        Some(page) => out.push_str(&format!(
                            "[{n}] ({source}, page {page}, lines {}-{})\n",
                            p.start_line, p.end_line
                        )),
                        None => out.push_str(&format!(
                            "[{n}] ({source}, lines {}-{})\n",
                            p.start_line, p.end_line
                        )),
                    }
                }
                None => out.push_str(&format!("[{n}]\n")),
            }
            out.push_str(&item.text);
            out.push_str("\n\n");
        }
        out
    }

    /// Generate an answer grounded in `items`.
    pub async fn generate(&self, query: &str, items: &[RetrievedItem]) -> Result<GeneratedAnswer> {
        if query.trim().is_empty() {
            return Err(NoemaError::Validation("query must not be empty".into()));
        }
        if items.is_empty() {
            return Ok(GeneratedAnswer {
                answer: NO_CONTEXT_ANSWER.to_string(),
                context: String::new(),
                citations: Vec::new(),
            });
        }

        let context = Self::format_context(items);
        let request = CompletionRequest::plain(
            self.model.clone(),
            answer_prompt(query, &context),
            self.temperature,
            self.deadline,
        );

        let answer = self
            .retry
            .run(|| {
                let request = request.clone();
                async move {
                    self.limiter.acquire().await;
                    self.llm.complete(&request).await.map_err(NoemaError::from)
                }
            })
            .await?
            .value;

        let citations = items
            .iter()
            .enumerate()
            .map(|(i, item)| Citation {
                index: i + 1,
                id: item.id,
                provenance: item.provenance.clone(),
            })
            .collect();

        debug!(context_items = items.len(), "answer generated");
        Ok(GeneratedAnswer {
            answer,
            context,
            citations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetrievedKind;
    use noema_core::LimiterConfig;
    use noema_storage::ScriptedLanguageModel;

    fn generator(llm: Arc<ScriptedLanguageModel>) -> AnswerGenerator {
        AnswerGenerator::new(
            llm,
            Arc::new(TokenBucket::new(LimiterConfig::default())),
            &NoemaConfig::default(),
        )
    }

    fn chunk_item(text: &str, path: &str) -> RetrievedItem {
        RetrievedItem {
            id: Uuid::new_v4(),
            kind: RetrievedKind::Chunk,
            text: text.to_string(),
            score: 0.9,
            provenance: Some(Provenance {
                data_id: Uuid::new_v4(),
                chunk_id: Uuid::new_v4(),
                source_path: Some(path.to_string()),
                page_number: Some(2),
                start_line: 3,
                end_line: 10,
                start_char: 0,
                end_char: text.len(),
            }),
        }
    }

    #[tokio::test]
    async fn no_context_returns_fixed_answer_without_model_call() {
        let llm = Arc::new(ScriptedLanguageModel::new());
        let out = generator(llm.clone()).generate("who?", &[]).await.unwrap();
        assert_eq!(out.answer, NO_CONTEXT_ANSWER);
        assert!(out.citations.is_empty());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn answer_passes_through_with_citations() {
        let llm = Arc::new(ScriptedLanguageModel::new());
        llm.set_default_completion("Alice works at Acme [1].");

        let items = vec![chunk_item("Alice works at Acme.", "tiny.txt")];
        let out = generator(llm.clone()).generate("Where does Alice work?", &items).await.unwrap();

        assert_eq!(out.answer, "Alice works at Acme [1].");
        assert_eq!(out.citations.len(), 1);
        assert_eq!(out.citations[0].index, 1);

        // The prompt carried the numbered, provenance-annotated context.
        let prompt = &llm.calls()[0].prompt;
        assert!(prompt.contains("[1] (tiny.txt, page 2, lines 3-10)"));
        assert!(prompt.contains("Where does Alice work?"));
    }

    #[test]
    fn context_formatting_numbers_items() {
        let items = vec![
            chunk_item("First chunk.", "a.txt"),
            chunk_item("Second chunk.", "b.txt"),
        ];
        let context = AnswerGenerator::format_context(&items);
        assert!(context.contains("[1] (a.txt"));
        assert!(context.contains("[2] (b.txt"));
        assert!(context.contains("First chunk."));
    }
}
