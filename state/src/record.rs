use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use veld_resource::ResourceId;

use crate::secret::SecretBox;
use crate::Value;

pub const STATE_VERSION: u32 = 1;

/// blake3 digest of a value's canonical JSON encoding, hex-encoded.
///
/// One-way, so digests of secret values are safe to persist and
/// compare.
pub fn digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// An output value as persisted: plaintext, or encrypted when secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredValue {
    Plain(Value),
    Secret(SecretBox),
}

/// Durable record of one resource's last successful apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    /// Provider-assigned id, required for update and delete calls.
    pub provider_id: String,
    /// Per-property digests of the last-applied input values.
    pub inputs: IndexMap<String, String>,
    pub outputs: IndexMap<String, StoredValue>,
    /// Dependency identities at time of last apply.
    pub dependency_ids: BTreeSet<ResourceId>,
    /// Provider id of a superseded instance a replacement could not
    /// delete; retried on the next run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_delete: Option<String>,
}

/// The on-disk state document: plain JSON, keyed by resource identity
/// string, readable without the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub resources: IndexMap<ResourceId, StateRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: IndexMap::new(),
        }
    }
}
