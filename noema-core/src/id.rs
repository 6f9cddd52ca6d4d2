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

//! Deterministic identity derivation.
//!
//! Semantic content (documents, chunks, entities, vector records) gets a
//! UUIDv5 derived from tenant + content, so re-ingesting the same bytes
//! yields the same ids and every write stays an idempotent upsert. Runs and
//! other ephemeral rows use random v4 ids.

use uuid::Uuid;

/// Hex blake3 digest of raw content. Stored on `Data` rows for dedup.
pub fn content_hash(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

/// The v5 namespace for a tenant. All semantic ids for that tenant are
/// derived inside this namespace, which is what keeps tenants disjoint even
/// for byte-identical content.
pub fn tenant_namespace(tenant_id: Uuid) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, tenant_id.as_bytes())
}

/// Id for an ingested document, derived from its content hash.
pub fn data_id(tenant_id: Uuid, hash: &str) -> Uuid {
    Uuid::new_v5(&tenant_namespace(tenant_id), hash.as_bytes())
}

/// Id for a chunk, derived from the owning document, the chunk's position
/// and its text. Re-chunking unchanged text reproduces the same ids.
pub fn chunk_id(data_id: Uuid, chunk_index: usize, text: &str) -> Uuid {
    let text_hash = blake3::hash(text.as_bytes());
    let key = format!("{}:{}:{}", data_id, chunk_index, text_hash.to_hex());
    Uuid::new_v5(&data_id, key.as_bytes())
}

/// Id for a canonical entity, derived from its normalized name and type
/// inside the tenant namespace. Two mentions of the same name+type collapse
/// to one node without coordination.
pub fn entity_id(tenant_id: Uuid, normalized_name: &str, entity_type: &str) -> Uuid {
    let key = format!("{}:{}", normalized_name, entity_type);
    Uuid::new_v5(&tenant_namespace(tenant_id), key.as_bytes())
}

/// Id for a derived data point (e.g. a distillation item) keyed by its
/// parent and ordinal.
pub fn derived_id(parent: Uuid, label: &str, index: usize) -> Uuid {
    Uuid::new_v5(&parent, format!("{label}:{index}").as_bytes())
}
