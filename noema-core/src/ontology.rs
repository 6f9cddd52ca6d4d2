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

//! Domain ontology whitelist.
//!
//! A deployment can pin the entity and relation types the extractor is
//! allowed to produce. Disabled (the default) or empty lists mean no
//! constraint, so existing configurations keep working unchanged.

use serde::{Deserialize, Serialize};

/// One declared type in the ontology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyType {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl OntologyType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }
}

/// The ontology configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ontology {
    pub enabled: bool,
    pub entity_types: Vec<OntologyType>,
    pub relation_types: Vec<OntologyType>,
}

impl Ontology {
    /// Whitelisted entity type names in declaration order, or `None` when
    /// the ontology is disabled or declares no entity types.
    pub fn allowed_entity_types(&self) -> Option<Vec<&str>> {
        if !self.enabled || self.entity_types.is_empty() {
            return None;
        }
        Some(self.entity_types.iter().map(|t| t.name.as_str()).collect())
    }

    /// Whitelisted relation type names in declaration order, or `None`
    /// when the ontology is disabled or declares no relation types.
    pub fn allowed_relation_types(&self) -> Option<Vec<&str>> {
        if !self.enabled || self.relation_types.is_empty() {
            return None;
        }
        Some(
            self.relation_types
                .iter()
                .map(|t| t.name.as_str())
                .collect(),
        )
    }
}
