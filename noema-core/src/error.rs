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

//! Error taxonomy shared by every Noema crate.
//!
//! Drivers and providers convert their own error types into this taxonomy at
//! the port boundary; the pipeline engine decides fatal-vs-continue from the
//! variant alone, never from message text.

use std::time::Duration;
use thiserror::Error;

/// Result type used across the Noema workspace.
pub type Result<T> = std::result::Result<T, NoemaError>;

/// The error taxonomy every subsystem speaks.
#[derive(Debug, Error)]
pub enum NoemaError {
    /// A caller-supplied argument is malformed (unknown dataset, bad top_k).
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Network failure, 5xx, timeout or rate limit; retryable with backoff.
    #[error("transient backend failure: {message}")]
    TransientBackend {
        message: String,
        /// Provider-supplied retry-after hint, if any.
        retry_after: Option<Duration>,
    },

    /// Auth failure, non-429 4xx, or schema violation after all re-asks.
    #[error("permanent backend failure: {message}")]
    PermanentBackend { message: String },

    /// Referential breakage (missing edge endpoint, id collision). The item
    /// is dropped and counted; the run itself still succeeds.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// An optional subsystem (validator, reranker) is unavailable; the
    /// caller falls back to default behavior and records a warning.
    #[error("degraded subsystem: {0}")]
    Degraded(String),

    /// The cancellation signal was observed.
    #[error("operation cancelled")]
    Cancelled,
}

impl NoemaError {
    /// Shorthand for a transient failure without a retry-after hint.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientBackend {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Shorthand for a transient failure carrying a provider hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::TransientBackend {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    /// Shorthand for a permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentBackend {
            message: message.into(),
        }
    }

    /// Whether a retry with backoff can possibly succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::TransientBackend { .. })
    }

    /// Stable machine-readable kind, surfaced on failed runs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::TransientBackend { .. } => "transient_backend",
            Self::PermanentBackend { .. } => "permanent_backend",
            Self::Integrity(_) => "integrity",
            Self::Degraded(_) => "degraded",
            Self::Cancelled => "cancelled",
        }
    }
}
