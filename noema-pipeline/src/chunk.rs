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

//! Document chunking.
//!
//! Splits a document's text into token-budgeted chunks on paragraph
//! boundaries where possible, falling back to sentence and finally
//! character-level cuts. Every chunk is an exact substring of the source
//! text and carries its char and line range, so a citation can scroll to
//! the original position. Consecutive chunks share a bounded token overlap.

use noema_core::{GraphEdge, GraphNode, GraphProjection, Provenance, TokenEstimator, NODE_CHUNK};
use noema_storage::{DataRecord, RawDocument, TextBlock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Raw bytes plus the relational row they were registered under, waiting
/// for a loader.
#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub data: DataRecord,
    pub raw: RawDocument,
}

/// How a chunk's right edge was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutType {
    Paragraph,
    Sentence,
    CharacterSplit,
    EndOfText,
}

/// A contiguous slice of one document, the unit of extraction and
/// vector indexing. Never mutated once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub data_id: Uuid,
    pub dataset_id: Uuid,
    pub tenant_id: Uuid,
    pub text: String,
    pub chunk_index: usize,
    pub token_count: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<u32>,
    pub cut_type: CutType,
    pub source_path: Option<String>,
}

impl DocumentChunk {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            data_id: self.data_id,
            chunk_id: self.id,
            source_path: self.source_path.clone(),
            page_number: self.page_number,
            start_line: self.start_line,
            end_line: self.end_line,
            start_char: self.start_char,
            end_char: self.end_char,
        }
    }
}

impl GraphProjection for DocumentChunk {
    fn nodes(&self) -> Vec<GraphNode> {
        vec![GraphNode::new(self.id, NODE_CHUNK, self.tenant_id, self.dataset_id)
            .with_source(self.data_id, Some(self.id))
            .with_property("text", self.text.clone())
            .with_property("chunk_index", self.chunk_index)
            .with_property("token_count", self.token_count)
            .with_property("start_line", self.start_line)
            .with_property("end_line", self.end_line)
            .with_property("start_char", self.start_char)
            .with_property("end_char", self.end_char)
            .with_property(
                "source_path",
                self.source_path.clone().unwrap_or_default(),
            )
            .with_property("page_number", json!(self.page_number))
            .with_index_fields(&["text"])]
    }

    fn edges(&self) -> Vec<GraphEdge> {
        Vec::new()
    }
}

/// Input to the chunker: the loaded text plus identity and positions.
#[derive(Debug, Clone)]
pub struct ChunkableDocument {
    pub data_id: Uuid,
    pub dataset_id: Uuid,
    pub tenant_id: Uuid,
    pub source_path: Option<String>,
    pub text: String,
    pub blocks: Vec<TextBlock>,
}

/// Paragraph-first splitter with a hard token budget.
pub struct TextChunker<'a> {
    tokenizer: &'a dyn TokenEstimator,
    max_tokens: usize,
    overlap: usize,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    tokens: usize,
    cut: CutType,
}

impl<'a> TextChunker<'a> {
    pub fn new(tokenizer: &'a dyn TokenEstimator, max_tokens: usize, overlap: usize) -> Self {
        Self {
            tokenizer,
            max_tokens: max_tokens.max(1),
            overlap,
        }
    }

    /// Split a document into chunks. Lazy callers can use
    /// [`split_from`](Self::split_from) to resume at a chunk index.
    pub fn split(&self, doc: &ChunkableDocument) -> Vec<DocumentChunk> {
        self.split_from(doc, 0)
    }

    /// Split, skipping the first `from_index` chunks. Chunk identity is
    /// deterministic, so resuming yields the same ids as a full pass.
    pub fn split_from(&self, doc: &ChunkableDocument, from_index: usize) -> Vec<DocumentChunk> {
        if doc.text.is_empty() {
            return Vec::new();
        }

        let segments = self.segment(&doc.text);
        let mut chunks = Vec::new();
        let mut window: Vec<Segment> = Vec::new();
        let mut window_tokens = 0usize;
        let mut index = 0usize;

        let mut emit = |window: &[Segment], cut: CutType, index: &mut usize| {
            if window.is_empty() {
                return;
            }
            let start = window[0].start;
            let end = window[window.len() - 1].end;
            if *index >= from_index {
                chunks.push(self.make_chunk(doc, start, end, *index, cut));
            }
            *index += 1;
        };

        for segment in segments {
            if window_tokens + segment.tokens > self.max_tokens && !window.is_empty() {
                emit(&window, window[window.len() - 1].cut, &mut index);
                let keep = self.overlap_tail(&window);
                window = keep;
                window_tokens = window.iter().map(|s| s.tokens).sum();
            }
            window.push(segment);
            window_tokens += segment.tokens;
        }
        emit(&window, CutType::EndOfText, &mut index);

        chunks
    }

    /// Trailing segments of the previous window worth at most `overlap`
    /// tokens. Never the whole window, so the cursor always advances.
    fn overlap_tail(&self, window: &[Segment]) -> Vec<Segment> {
        if self.overlap == 0 || window.len() <= 1 {
            return Vec::new();
        }
        let mut tail: Vec<Segment> = Vec::new();
        let mut tokens = 0usize;
        for segment in window.iter().rev() {
            if tokens + segment.tokens > self.overlap || tail.len() + 1 >= window.len() {
                break;
            }
            tokens += segment.tokens;
            tail.push(*segment);
        }
        tail.reverse();
        tail
    }

    /// Tile the text into segments: paragraphs, oversized paragraphs into
    /// sentences, oversized sentences into character-budget pieces.
    fn segment(&self, text: &str) -> Vec<Segment> {
        let mut result = Vec::new();
        for (start, end) in paragraph_spans(text) {
            let tokens = self.tokenizer.count(&text[start..end]);
            if tokens <= self.max_tokens {
                result.push(Segment {
                    start,
                    end,
                    tokens,
                    cut: CutType::Paragraph,
                });
                continue;
            }
            for (s_start, s_end) in sentence_spans(text, start, end) {
                let s_tokens = self.tokenizer.count(&text[s_start..s_end]);
                if s_tokens <= self.max_tokens {
                    result.push(Segment {
                        start: s_start,
                        end: s_end,
                        tokens: s_tokens,
                        cut: CutType::Sentence,
                    });
                } else {
                    self.char_split(text, s_start, s_end, &mut result);
                }
            }
        }
        result
    }

    /// Hard split at exactly the token budget, on char boundaries.
    fn char_split(&self, text: &str, start: usize, end: usize, out: &mut Vec<Segment>) {
        let mut cursor = start;
        while cursor < end {
            let piece_end = self.largest_fitting_end(text, cursor, end);
            let tokens = self.tokenizer.count(&text[cursor..piece_end]);
            out.push(Segment {
                start: cursor,
                end: piece_end,
                tokens,
                cut: CutType::CharacterSplit,
            });
            cursor = piece_end;
        }
    }

    /// Binary search over char boundaries for the longest prefix within
    /// the token budget.
    fn largest_fitting_end(&self, text: &str, start: usize, end: usize) -> usize {
        let boundaries: Vec<usize> = text[start..end]
            .char_indices()
            .map(|(i, _)| start + i)
            .skip(1)
            .chain(std::iter::once(end))
            .collect();
        let mut lo = 0usize;
        let mut hi = boundaries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.tokenizer.count(&text[start..boundaries[mid]]) <= self.max_tokens {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            // A single char exceeding the budget still has to move forward.
            boundaries[0]
        } else {
            boundaries[lo - 1]
        }
    }

    fn make_chunk(
        &self,
        doc: &ChunkableDocument,
        start: usize,
        end: usize,
        index: usize,
        cut: CutType,
    ) -> DocumentChunk {
        let text = doc.text[start..end].to_string();
        let start_line = 1 + doc.text[..start].matches('\n').count();
        let end_line = 1 + doc.text[..end].matches('\n').count();
        let page_number = doc
            .blocks
            .iter()
            .find(|b| b.start_char <= start && start < b.end_char)
            .and_then(|b| b.page_number);
        DocumentChunk {
            id: noema_core::id::chunk_id(doc.data_id, index, &text),
            data_id: doc.data_id,
            dataset_id: doc.dataset_id,
            tenant_id: doc.tenant_id,
            token_count: self.tokenizer.count(&text),
            text,
            chunk_index: index,
            start_line,
            end_line,
            start_char: start,
            end_char: end,
            page_number,
            cut_type: cut,
            source_path: doc.source_path.clone(),
        }
    }
}

/// Paragraph spans tiling the whole text; each span carries its trailing
/// blank-line separator so spans concatenate back to the original.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'\n' && i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
            let mut sep_end = i;
            while sep_end < bytes.len() && bytes[sep_end] == b'\n' {
                sep_end += 1;
            }
            spans.push((start, sep_end));
            start = sep_end;
            i = sep_end;
        } else {
            i += 1;
        }
    }
    if start < bytes.len() {
        spans.push((start, bytes.len()));
    }
    spans
}

/// Sentence spans tiling `text[start..end]`. A boundary follows '.', '!'
/// or '?' plus trailing whitespace, or a single newline.
fn sentence_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut span_start = start;
    let mut i = start;
    while i < end {
        let b = bytes[i];
        let is_terminal = matches!(b, b'.' | b'!' | b'?');
        if is_terminal || b == b'\n' {
            let mut boundary = i + 1;
            while boundary < end && matches!(bytes[boundary], b' ' | b'\t' | b'\n') {
                boundary += 1;
            }
            if is_terminal && boundary == i + 1 && boundary < end {
                // '.' inside a token (e.g. "3.14"); not a boundary.
                i += 1;
                continue;
            }
            spans.push((span_start, boundary));
            span_start = boundary;
            i = boundary;
        } else {
            i += 1;
        }
    }
    if span_start < end {
        spans.push((span_start, end));
    }
    spans
}
