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

//! Cross-chunk entity resolution.
//!
//! Merges duplicate entity mentions into canonical entities with a
//! deterministic single pass: exact and alias buckets first, then a fuzzy
//! Levenshtein pass per type, then an embedding comparison for the
//! ambiguous band. Entities of different types never merge. Losing ids are
//! reported so stale references keep resolving.

use crate::extract::Entity;
use noema_core::{NoemaError, ResolveConfig, Result};
use noema_storage::{cosine_similarity, Embedder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

/// Title and honorific suffixes stripped to obtain a core name before
/// comparing CJK person names.
const CJK_TITLE_SUFFIXES: &[&str] = &[
    "董事长", "副董事长", "总经理", "副总经理", "总裁", "副总裁", "总监", "副总监", "经理",
    "副经理", "主任", "副主任", "部长", "副部长", "处长", "副处长", "科长", "副科长", "主管",
    "组长", "负责人", "秘书长", "书记", "副书记", "委员", "顾问", "助理", "院长", "副院长",
    "所长", "副所长", "总工程师", "工程师", "会计师", "律师", "教授", "博士", "硕士", "先生",
    "女士", "老师", "同志", "总",
];

/// Western honorific prefixes/suffixes stripped during normalization.
const TITLE_SUFFIXES: &[&str] = &[" jr.", " jr", " sr.", " sr", " iii", " ii", " phd", " md"];

/// Normalize an entity name: NFC, whitespace collapse, full-width ASCII
/// folding, edge punctuation strip, case fold for non-CJK scripts, known
/// honorific suffixes removed.
pub fn normalize_name(name: &str) -> String {
    let nfc: String = name.nfc().collect();
    let folded: String = nfc
        .chars()
        .map(|c| match c {
            // Full-width ASCII block to half-width.
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            _ => c,
        })
        .collect();

    let mut collapsed = String::with_capacity(folded.len());
    let mut last_was_space = true;
    for c in folded.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
                last_was_space = true;
            }
        } else {
            collapsed.push(c);
            last_was_space = false;
        }
    }

    let trimmed = collapsed
        .trim_matches(|c: char| ".,;:!?。，；：！？".contains(c))
        .trim()
        .to_string();

    let mut normalized = if contains_cjk(&trimmed) {
        trimmed
    } else {
        trimmed.to_lowercase()
    };

    if !contains_cjk(&normalized) {
        for suffix in TITLE_SUFFIXES {
            if let Some(stripped) = normalized.strip_suffix(suffix) {
                if !stripped.is_empty() {
                    normalized = stripped.trim_end_matches(',').trim().to_string();
                    break;
                }
            }
        }
    }

    normalized
}

/// Whether the string contains CJK ideographs.
pub fn contains_cjk(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(c as u32,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
    })
}

/// Strip the longest known title suffix from a CJK name.
pub fn cjk_core_name(name: &str) -> &str {
    let mut suffixes: Vec<&str> = CJK_TITLE_SUFFIXES.to_vec();
    suffixes.sort_by_key(|s| std::cmp::Reverse(s.len()));
    for suffix in suffixes {
        if let Some(stripped) = name.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    name
}

/// Levenshtein similarity in [0,1] over chars.
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a_chars, &b_chars);
    1.0 - distance as f64 / max_len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Name similarity with script-aware boosts:
/// - CJK core-name equality scores 0.95, single-character family-name
///   prefix scores 0.85;
/// - containment where the shorter covers >= 80% of the longer raises the
///   score to at least 0.9;
/// - otherwise plain Levenshtein similarity.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let mut score = levenshtein_similarity(a, b);

    if contains_cjk(a) || contains_cjk(b) {
        let core_a = cjk_core_name(a);
        let core_b = cjk_core_name(b);
        if !core_a.is_empty() && core_a == core_b {
            score = score.max(0.95);
        } else {
            let len_a = core_a.chars().count();
            let len_b = core_b.chars().count();
            if (len_a == 1 && core_b.starts_with(core_a))
                || (len_b == 1 && core_a.starts_with(core_b))
            {
                score = score.max(0.85);
            }
        }
    }

    if a.contains(b) || b.contains(a) {
        let shorter = a.chars().count().min(b.chars().count());
        let longer = a.chars().count().max(b.chars().count());
        if longer > 0 && shorter as f64 / longer as f64 >= 0.8 {
            score = score.max(0.9);
        }
    }

    score
}

/// Result of a resolution pass.
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// Canonical survivors, in deterministic order.
    pub entities: Vec<Entity>,
    /// `(losing_id, canonical_id)` for every merged-away entity.
    pub alias_of: Vec<(Uuid, Uuid)>,
    /// How many input entities were merged away.
    pub merged: u64,
}

impl ResolutionOutcome {
    /// Map any input id to its canonical id.
    pub fn canonical_id(&self, id: Uuid) -> Uuid {
        self.alias_of
            .iter()
            .find(|(losing, _)| *losing == id)
            .map(|(_, canonical)| *canonical)
            .unwrap_or(id)
    }
}

/// Deterministic union-find resolver.
pub struct EntityResolver {
    config: ResolveConfig,
    embedder: Option<Arc<dyn Embedder>>,
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, x: usize, y: usize) {
        let (px, py) = (self.find(x), self.find(y));
        if px != py {
            // Lower root wins so grouping stays input-order deterministic.
            let (low, high) = if px < py { (px, py) } else { (py, px) };
            self.parent[high] = low;
        }
    }
}

impl EntityResolver {
    pub fn new(config: ResolveConfig, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { config, embedder }
    }

    /// Merge duplicate mentions. Pure compute apart from the optional
    /// embedding comparisons; never fails on content.
    pub async fn resolve(&self, input: Vec<Entity>) -> Result<ResolutionOutcome> {
        // Step 0: collapse identical ids (same normalized name + type) from
        // different chunks, pooling their source chunks and aliases.
        let entities = collapse_identical(input);
        let n = entities.len();
        if n <= 1 {
            return Ok(ResolutionOutcome {
                entities,
                alias_of: Vec::new(),
                merged: 0,
            });
        }

        let mut uf = UnionFind::new(n);

        // Exact bucket: same normalized name and type.
        let mut exact: HashMap<(String, String), usize> = HashMap::new();
        for (i, e) in entities.iter().enumerate() {
            let key = (e.normalized_name.clone(), e.entity_type.clone());
            match exact.get(&key).copied() {
                Some(first) => uf.union(first, i),
                None => {
                    exact.insert(key, i);
                }
            }
        }

        // Alias bucket: an alias of one entity naming another of the same
        // type.
        let mut by_surface: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (i, e) in entities.iter().enumerate() {
            by_surface
                .entry((e.normalized_name.clone(), e.entity_type.clone()))
                .or_default()
                .push(i);
        }
        for (i, e) in entities.iter().enumerate() {
            for alias in &e.aliases {
                let alias_norm = normalize_name(alias);
                if alias_norm.is_empty() {
                    continue;
                }
                if let Some(matches) = by_surface.get(&(alias_norm, e.entity_type.clone())) {
                    for &j in matches {
                        uf.union(i, j);
                    }
                }
            }
        }

        // Fuzzy pass within each type, blocked by name prefix above the
        // pair budget. Ambiguous pairs go to the embedding pass.
        let mut by_type: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, e) in entities.iter().enumerate() {
            by_type.entry(e.entity_type.as_str()).or_default().push(i);
        }

        let mut ambiguous: Vec<(usize, usize)> = Vec::new();
        for indices in by_type.values() {
            let blocks = if indices.len() > self.config.blocking_limit {
                block_by_prefix(&entities, indices)
            } else {
                vec![indices.clone()]
            };
            for block in blocks {
                for (a_pos, &i) in block.iter().enumerate() {
                    for &j in &block[a_pos + 1..] {
                        if uf.find(i) == uf.find(j) {
                            continue;
                        }
                        let score = name_similarity(
                            &entities[i].normalized_name,
                            &entities[j].normalized_name,
                        );
                        if score >= self.config.fuzzy_threshold {
                            uf.union(i, j);
                        } else if score >= self.config.embedding_band_floor {
                            ambiguous.push((i, j));
                        }
                    }
                }
            }
        }

        // Embedding pass over the ambiguous band.
        if !ambiguous.is_empty() {
            if let Some(embedder) = &self.embedder {
                let vectors = self.embed_entities(&entities, &ambiguous, embedder).await?;
                for (i, j) in ambiguous {
                    if uf.find(i) == uf.find(j) {
                        continue;
                    }
                    if let (Some(vi), Some(vj)) = (vectors.get(&i), vectors.get(&j)) {
                        let similarity = cosine_similarity(vi, vj) as f64;
                        if similarity >= self.config.embedding_threshold {
                            uf.union(i, j);
                        }
                    }
                }
            } else {
                debug!(
                    pairs = ambiguous.len(),
                    "no embedder wired; ambiguous pairs left unmerged"
                );
            }
        }

        // Canonical election and merge.
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            groups.entry(uf.find(i)).or_default().push(i);
        }
        let mut roots: Vec<usize> = groups.keys().copied().collect();
        roots.sort_unstable();

        let mut survivors = Vec::with_capacity(roots.len());
        let mut alias_of = Vec::new();
        let mut merged = 0u64;
        for root in roots {
            let group = &groups[&root];
            let canonical_pos = elect_canonical(&entities, group);
            let mut canonical = entities[canonical_pos].clone();
            for &i in group {
                if i == canonical_pos {
                    continue;
                }
                merged += 1;
                let loser = &entities[i];
                alias_of.push((loser.id, canonical.id));
                absorb(&mut canonical, loser);
            }
            canonical.aliases.sort();
            canonical.aliases.dedup();
            canonical.source_chunks.sort();
            canonical.source_chunks.dedup();
            survivors.push(canonical);
        }

        info!(input = n, output = survivors.len(), merged, "entity resolution complete");
        Ok(ResolutionOutcome {
            entities: survivors,
            alias_of,
            merged,
        })
    }

    async fn embed_entities(
        &self,
        entities: &[Entity],
        pairs: &[(usize, usize)],
        embedder: &Arc<dyn Embedder>,
    ) -> Result<HashMap<usize, Vec<f32>>> {
        let mut wanted: Vec<usize> = pairs.iter().flat_map(|&(i, j)| [i, j]).collect();
        wanted.sort_unstable();
        wanted.dedup();

        let texts: Vec<String> = wanted
            .iter()
            .map(|&i| {
                let e = &entities[i];
                if e.description.is_empty() {
                    e.normalized_name.clone()
                } else {
                    format!("{}. {}", e.normalized_name, e.description)
                }
            })
            .collect();

        let vectors = embedder
            .embed(&texts)
            .await
            .map_err(NoemaError::from)?;

        Ok(wanted.into_iter().zip(vectors).collect())
    }
}

/// Collapse entries sharing a deterministic id, pooling their evidence.
/// This much dedup always runs, even with resolution disabled, because
/// equal ids are the same entity by construction.
pub fn collapse_identical(input: Vec<Entity>) -> Vec<Entity> {
    let mut by_id: HashMap<Uuid, usize> = HashMap::new();
    let mut merged: Vec<Entity> = Vec::new();
    for entity in input {
        match by_id.get(&entity.id).copied() {
            Some(slot) => absorb(&mut merged[slot], &entity),
            None => {
                by_id.insert(entity.id, merged.len());
                merged.push(entity);
            }
        }
    }
    for e in &mut merged {
        e.aliases.sort();
        e.aliases.dedup();
        e.source_chunks.sort();
        e.source_chunks.dedup();
    }
    merged
}

/// Merge a losing entity's evidence into the canonical one.
fn absorb(canonical: &mut Entity, loser: &Entity) {
    if loser.name != canonical.name && !canonical.aliases.contains(&loser.name) {
        canonical.aliases.push(loser.name.clone());
    }
    for alias in &loser.aliases {
        if *alias != canonical.name && !canonical.aliases.contains(alias) {
            canonical.aliases.push(alias.clone());
        }
    }
    canonical.source_chunks.extend(loser.source_chunks.iter().copied());
    if canonical.description.is_empty() && !loser.description.is_empty() {
        canonical.description = loser.description.clone();
    }
    canonical.confidence = canonical.confidence.max(loser.confidence);
}

/// Highest confidence, then longest description, then lexicographically
/// smallest name.
fn elect_canonical(entities: &[Entity], group: &[usize]) -> usize {
    let mut best = group[0];
    for &i in &group[1..] {
        let (a, b) = (&entities[i], &entities[best]);
        let candidate_wins = a.confidence > b.confidence
            || (a.confidence == b.confidence && a.description.len() > b.description.len())
            || (a.confidence == b.confidence
                && a.description.len() == b.description.len()
                && a.name < b.name);
        if candidate_wins {
            best = i;
        }
    }
    best
}

/// Block a large candidate set by the first three chars of the normalized
/// name, trading recall for bounded pair counts.
fn block_by_prefix(entities: &[Entity], indices: &[usize]) -> Vec<Vec<usize>> {
    let mut blocks: HashMap<String, Vec<usize>> = HashMap::new();
    for &i in indices {
        let prefix: String = entities[i].normalized_name.chars().take(3).collect();
        blocks.entry(prefix).or_default().push(i);
    }
    let mut out: Vec<Vec<usize>> = blocks.into_values().collect();
    out.sort_by_key(|b| b.first().copied());
    out
}
