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

//! Prompt templates for every LLM call the pipeline makes.

/// Entity types the extractor accepts. Anything else is rewritten to
/// `Other`.
pub const DECLARED_ENTITY_TYPES: &[&str] = &[
    "Person",
    "Organization",
    "Location",
    "Event",
    "Product",
    "Technology",
    "Concept",
    "Other",
];

/// Build the graph-extraction prompt for one chunk. `entity_types` is
/// either the declared defaults or an ontology whitelist.
pub fn extraction_prompt(chunk_text: &str, entity_types: &[String]) -> String {
    format!(
        r#"You are a knowledge graph extraction system. Extract entities and the relations between them from the text below.

## VALID ENTITY TYPES (use EXACTLY these)
{types}

## RULES
1. Every entity gets: name (as written in the text), type, a one-sentence description, optional aliases.
2. Every relation gets: source entity name, target entity name, a snake_case predicate (e.g. works_at, based_in, part_of), and a confidence in [0,1].
3. Relation endpoints MUST be names from your entity list.
4. Confidence: 0.9+ for explicit statements, 0.7-0.9 for strongly implied, below 0.7 for uncertain.
5. Do not invent facts that are not in the text.

## EXAMPLE

Text: "Marie Curie worked at the University of Paris."
Output:
{{"nodes": [
  {{"name": "Marie Curie", "type": "Person", "description": "Physicist and chemist mentioned as working at the University of Paris.", "aliases": [], "confidence": 0.98}},
  {{"name": "University of Paris", "type": "Organization", "description": "University where Marie Curie worked.", "aliases": [], "confidence": 0.97}}
],
"edges": [
  {{"source": "Marie Curie", "target": "University of Paris", "relation": "works_at", "confidence": 0.95}}
]}}

## TEXT
{chunk}

## OUTPUT
Return ONLY a JSON object with "nodes" and "edges" arrays. No markdown fences, no commentary."#,
        types = entity_types.join(", "),
        chunk = chunk_text,
    )
}

/// The default entity types as owned strings, for callers without an
/// ontology whitelist.
pub fn declared_entity_types() -> Vec<String> {
    DECLARED_ENTITY_TYPES.iter().map(|t| t.to_string()).collect()
}

/// Appended when a response failed schema validation and we re-ask.
pub fn schema_repair_suffix(error: &str) -> String {
    format!(
        "\n\n## CORRECTION\nYour previous response was not valid against the required schema ({error}). Return ONLY the JSON object, exactly matching the schema."
    )
}

/// Build the relation-validation prompt: an indexed list of candidate
/// triples with their source text, scored in one call.
pub fn validation_prompt(candidates: &[(usize, String, String, String, String)]) -> String {
    let mut lines = String::new();
    for (index, source, relation, target, context) in candidates {
        let excerpt: String = context.chars().take(200).collect();
        lines.push_str(&format!(
            "[{index}] {source} --{relation}--> {target} (source: {excerpt})\n"
        ));
    }
    format!(
        r#"You are validating relations extracted from text. For each candidate below, judge how well the source text supports the stated relation.

Score each with a confidence in [0,1]:
- 1.0: the text states the relation explicitly
- 0.7: the text strongly implies it
- 0.4: weakly implied or ambiguous
- 0.0: contradicted or absent

## CANDIDATES
{lines}
## OUTPUT
Return ONLY a JSON object: {{"scores": [{{"index": <int>, "confidence": <float>, "reason": "<short>"}}]}}. One entry per candidate."#
    )
}

/// Build the cross-chunk knowledge-distillation prompt for one document.
pub fn distillation_prompt(document_text: &str) -> String {
    format!(
        r#"You are distilling cross-cutting knowledge from a document. Produce statements that individual passages do not state on their own:

- enumeration: complete lists gathered across the document ("The three offices are X, Y and Z.")
- aggregation: totals, counts or rollups
- disambiguation: statements separating similar entities
- negation: what the document explicitly rules out
- qa: a likely question with its grounded answer

## DOCUMENT
{document_text}

## OUTPUT
Return ONLY a JSON object: {{"items": [{{"type": "<enumeration|aggregation|disambiguation|negation|qa>", "text": "<statement>"}}]}}. Skip categories with nothing to say."#
    )
}
