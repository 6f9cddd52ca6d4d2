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

//! Language-model port.
//!
//! Providers are external collaborators; the engine only sees
//! [`LanguageModel`] and the four-way [`CompletionError`] partition.
//! [`ScriptedLanguageModel`] is the recording test double every scenario
//! test drives.

use async_trait::async_trait;
use noema_core::NoemaError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// One structured or plain completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    /// JSON schema the response must satisfy; `None` for plain completions.
    pub schema: Option<Value>,
    pub temperature: f32,
    pub deadline: Duration,
}

impl CompletionRequest {
    pub fn structured(
        model: impl Into<String>,
        prompt: impl Into<String>,
        schema: Value,
        temperature: f32,
        deadline: Duration,
    ) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            schema: Some(schema),
            temperature,
            deadline,
        }
    }

    pub fn plain(
        model: impl Into<String>,
        prompt: impl Into<String>,
        temperature: f32,
        deadline: Duration,
    ) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            schema: None,
            temperature,
            deadline,
        }
    }
}

/// Provider error partition. Converted to the engine taxonomy at the
/// boundary via `From`.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("permanent provider failure: {0}")]
    Permanent(String),
    #[error("response violates schema: {0}")]
    SchemaViolation(String),
}

impl From<CompletionError> for NoemaError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::RateLimited { retry_after } => NoemaError::TransientBackend {
                message: "provider rate limit".to_string(),
                retry_after,
            },
            CompletionError::Transient(message) => NoemaError::TransientBackend {
                message,
                retry_after: None,
            },
            CompletionError::Permanent(message) => NoemaError::PermanentBackend { message },
            CompletionError::SchemaViolation(message) => NoemaError::PermanentBackend {
                message: format!("schema violation: {message}"),
            },
        }
    }
}

/// Port over the completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete against a strict JSON schema and return the parsed value.
    async fn structured_complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Value, CompletionError>;

    /// Plain grounded completion, used by the answer generator.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, CompletionError>;
}

/// A call observed by the scripted double.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub prompt: String,
    pub structured: bool,
    pub at: Instant,
}

enum Scripted {
    Value(Value),
    Error(CompletionError),
}

/// Deterministic, recording language model for tests.
///
/// Responses resolve in order: exact-queue pops first, then the first
/// prompt-substring rule that matches, then the default. Every call is
/// recorded with a timestamp so tests can assert what ran and when.
#[derive(Default)]
pub struct ScriptedLanguageModel {
    queue: Mutex<VecDeque<Scripted>>,
    rules: Mutex<Vec<(String, Value)>>,
    completion_rules: Mutex<Vec<(String, String)>>,
    default_structured: Mutex<Option<Value>>,
    default_completion: Mutex<Option<String>>,
    latency: Mutex<Option<Duration>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a one-shot structured response consumed in FIFO order, ahead
    /// of any substring rules.
    pub fn push_structured(&self, value: Value) {
        self.queue.lock().push_back(Scripted::Value(value));
    }

    /// Push a one-shot error.
    pub fn push_error(&self, error: CompletionError) {
        self.queue.lock().push_back(Scripted::Error(error));
    }

    /// Respond with `value` whenever the prompt contains `needle`. Rules
    /// survive across calls, which parallel stages need since their call
    /// order is not deterministic.
    pub fn respond_when(&self, needle: impl Into<String>, value: Value) {
        self.rules.lock().push((needle.into(), value));
    }

    /// Plain-completion analogue of [`respond_when`](Self::respond_when).
    pub fn complete_when(&self, needle: impl Into<String>, text: impl Into<String>) {
        self.completion_rules.lock().push((needle.into(), text.into()));
    }

    /// Fallback structured response when nothing else matches.
    pub fn set_default_structured(&self, value: Value) {
        *self.default_structured.lock() = Some(value);
    }

    /// Fallback plain response when nothing else matches.
    pub fn set_default_completion(&self, text: impl Into<String>) {
        *self.default_completion.lock() = Some(text.into());
    }

    /// Delay every call, for throttled-pipeline scenarios.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn record(&self, request: &CompletionRequest, structured: bool) {
        self.calls.lock().push(RecordedCall {
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            structured,
            at: Instant::now(),
        });
    }

    async fn apply_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    async fn structured_complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Value, CompletionError> {
        self.record(request, true);
        self.apply_latency().await;

        if let Some(next) = self.queue.lock().pop_front() {
            return match next {
                Scripted::Value(v) => Ok(v),
                Scripted::Error(e) => Err(e),
            };
        }
        for (needle, value) in self.rules.lock().iter() {
            if request.prompt.contains(needle.as_str()) {
                return Ok(value.clone());
            }
        }
        if let Some(default) = self.default_structured.lock().clone() {
            return Ok(default);
        }
        Err(CompletionError::Permanent(
            "scripted model has no response for this prompt".to_string(),
        ))
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<String, CompletionError> {
        self.record(request, false);
        self.apply_latency().await;

        for (needle, text) in self.completion_rules.lock().iter() {
            if request.prompt.contains(needle.as_str()) {
                return Ok(text.clone());
            }
        }
        if let Some(default) = self.default_completion.lock().clone() {
            return Ok(default);
        }
        Err(CompletionError::Permanent(
            "scripted model has no completion for this prompt".to_string(),
        ))
    }
}
