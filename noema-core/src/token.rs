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

//! Token counting.
//!
//! The chunker budgets text by the same tokenizer the model sees. When no
//! provider tokenizer is wired, the heuristic estimator approximates one
//! token per four bytes of UTF-8 and inflates the count by a safety margin
//! so a budgeted chunk never overruns the real context window.

/// Counts tokens the way a specific provider would.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Provider-agnostic fallback estimator.
#[derive(Debug, Clone)]
pub struct HeuristicTokenizer {
    bytes_per_token: f64,
    safety_margin: f64,
}

impl Default for HeuristicTokenizer {
    fn default() -> Self {
        Self {
            bytes_per_token: 4.0,
            safety_margin: 0.2,
        }
    }
}

impl HeuristicTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom ratio, margin still applied.
    pub fn with_ratio(bytes_per_token: f64) -> Self {
        Self {
            bytes_per_token: bytes_per_token.max(1.0),
            ..Self::default()
        }
    }
}

impl TokenEstimator for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let raw = text.len() as f64 / self.bytes_per_token;
        (raw * (1.0 + self.safety_margin)).ceil() as usize
    }
}
