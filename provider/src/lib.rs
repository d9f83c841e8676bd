mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use indexmap::IndexMap;
use thiserror::Error;
use veld_resource::ResourceType;

pub use crate::memory::MemoryProvider;

pub type Value = serde_json::Value;

/// Resolved input values for one provider operation.
pub type Inputs = IndexMap<String, Value>;

/// Outputs returned by a provider operation.
pub type Outputs = IndexMap<String, Value>;

/// Provider failures, classified for the executor's retry logic.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Worth retrying: network hiccup, timeout, rate limit.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Not worth retrying: validation failure, conflict.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// How a resource type behaves when inputs change.
#[derive(Debug, Clone, Default)]
pub struct ReplacementPolicy {
    /// Input properties whose change forces destroy-then-create
    /// instead of an in-place update.
    pub forces_replacement: BTreeSet<String>,
    /// Whether two live instances may coexist, allowing
    /// create-before-delete replacement without downtime.
    pub supports_coexistence: bool,
}

/// The cloud side of the orchestrator, as a capability.
///
/// Passed explicitly into the executor; implementations own any
/// connection state, which keeps test doubles trivial.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Create a resource, returning its outputs and provider-assigned id.
    async fn create(&self, ty: &ResourceType, inputs: &Inputs)
        -> Result<(Outputs, String), ProviderError>;

    /// Update a resource in place.
    async fn update(
        &self,
        ty: &ResourceType,
        id: &str,
        inputs: &Inputs,
    ) -> Result<Outputs, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, ty: &ResourceType, id: &str) -> Result<(), ProviderError>;

    /// Replacement behavior for a resource type.
    fn replacement_policy(&self, ty: &ResourceType) -> ReplacementPolicy;
}
