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

//! Document loader port.
//!
//! Format-specific parsing lives outside the engine; a loader turns raw
//! bytes into plain text plus positional blocks so chunk provenance can be
//! mapped back to pages and lines. Loaders register in priority order and
//! the first one that supports the file wins.

use async_trait::async_trait;
use noema_core::{NoemaError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A positional region of the extracted text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    pub start_line: usize,
    pub end_line: usize,
    pub start_char: usize,
    pub end_char: usize,
}

/// Loader output: the full text and its positional map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedDocument {
    pub text: String,
    pub blocks: Vec<TextBlock>,
}

/// Raw input handed to a loader.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub path: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl RawDocument {
    pub fn text_file(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime: "text/plain".to_string(),
            bytes: text.into().into_bytes(),
        }
    }

    pub fn extension(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or("")
    }
}

/// Port over format-specific parsers.
#[async_trait]
pub trait Loader: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, extension: &str, mime: &str) -> bool;

    async fn load(&self, source: &RawDocument) -> Result<LoadedDocument>;
}

/// UTF-8 plain text. The whole document is one block; line counts come
/// straight from the text.
pub struct PlainTextLoader;

#[async_trait]
impl Loader for PlainTextLoader {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn supports(&self, extension: &str, mime: &str) -> bool {
        matches!(extension, "txt" | "md" | "text" | "") || mime.starts_with("text/")
    }

    async fn load(&self, source: &RawDocument) -> Result<LoadedDocument> {
        let text = String::from_utf8(source.bytes.clone()).map_err(|e| {
            NoemaError::Validation(format!("{} is not valid UTF-8: {e}", source.path))
        })?;
        let line_count = text.lines().count().max(1);
        let blocks = if text.is_empty() {
            Vec::new()
        } else {
            vec![TextBlock {
                page_number: None,
                start_line: 1,
                end_line: line_count,
                start_char: 0,
                end_char: text.len(),
            }]
        };
        Ok(LoadedDocument { text, blocks })
    }
}

/// Priority-ordered loader registry; earlier entries win.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn Loader>>,
}

impl LoaderRegistry {
    /// Registry with the built-in plain-text loader.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(PlainTextLoader));
        registry
    }

    pub fn register(&mut self, loader: Arc<dyn Loader>) {
        self.loaders.push(loader);
    }

    /// First registered loader that supports the file.
    pub fn resolve(&self, extension: &str, mime: &str) -> Option<Arc<dyn Loader>> {
        self.loaders
            .iter()
            .find(|l| l.supports(extension, mime))
            .cloned()
    }
}
