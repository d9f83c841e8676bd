use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use veld_resource::ResourceType;

use crate::{Inputs, Outputs, ProviderClient, ProviderError, ReplacementPolicy};

/// An in-memory provider for local dry-runs and tests.
///
/// Created resources live in a map keyed by provider id; outputs echo
/// the inputs plus the generated `id`. Failures can be scripted per
/// resource type to exercise retry and partial-apply paths.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    policies: HashMap<ResourceType, ReplacementPolicy>,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    live: IndexMap<String, (ResourceType, Inputs)>,
    failures: HashMap<ResourceType, Failure>,
    log: Vec<String>,
}

#[derive(Debug)]
struct Failure {
    error: ProviderError,
    /// Remaining calls to fail; `None` fails every call.
    remaining: Option<u32>,
    /// Only this operation ("create" / "update" / "delete") fails;
    /// `None` fails them all.
    op: Option<String>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, ty: ResourceType, policy: ReplacementPolicy) -> Self {
        self.policies.insert(ty, policy);
        self
    }

    /// Fail every operation on `ty` with `error`.
    pub fn fail(&self, ty: ResourceType, error: ProviderError) {
        self.lock().failures.insert(
            ty,
            Failure {
                error,
                remaining: None,
                op: None,
            },
        );
    }

    /// Fail the next `times` operations on `ty`, then succeed.
    pub fn fail_times(&self, ty: ResourceType, error: ProviderError, times: u32) {
        self.lock().failures.insert(
            ty,
            Failure {
                error,
                remaining: Some(times),
                op: None,
            },
        );
    }

    /// Fail only `op` ("create" / "update" / "delete") on `ty`.
    pub fn fail_op(&self, ty: ResourceType, op: &str, error: ProviderError) {
        self.lock().failures.insert(
            ty,
            Failure {
                error,
                remaining: None,
                op: Some(op.to_string()),
            },
        );
    }

    /// Stop failing operations on `ty`.
    pub fn clear_failures(&self, ty: &ResourceType) {
        self.lock().failures.remove(ty);
    }

    /// Currently live resources, in creation order.
    pub fn live(&self) -> Vec<(String, ResourceType, Inputs)> {
        self.lock()
            .live
            .iter()
            .map(|(id, (ty, inputs))| (id.clone(), ty.clone(), inputs.clone()))
            .collect()
    }

    /// Log of operations performed, e.g. `"create test:thing"`.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory provider lock poisoned")
    }
}

impl Inner {
    fn check_failure(&mut self, ty: &ResourceType, op: &str) -> Result<(), ProviderError> {
        let Some(failure) = self.failures.get_mut(ty) else {
            return Ok(());
        };
        if failure.op.as_deref().is_some_and(|only| only != op) {
            return Ok(());
        }
        match &mut failure.remaining {
            None => Err(failure.error.clone()),
            Some(0) => Ok(()),
            Some(remaining) => {
                *remaining -= 1;
                Err(failure.error.clone())
            }
        }
    }
}

#[async_trait]
impl ProviderClient for MemoryProvider {
    async fn create(
        &self,
        ty: &ResourceType,
        inputs: &Inputs,
    ) -> Result<(Outputs, String), ProviderError> {
        let mut inner = self.lock();
        inner.log.push(format!("create {ty}"));
        inner.check_failure(ty, "create")?;

        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        inner.live.insert(id.clone(), (ty.clone(), inputs.clone()));

        let mut outputs = inputs.clone();
        outputs.insert("id".to_string(), json!(id.clone()));
        Ok((outputs, id))
    }

    async fn update(
        &self,
        ty: &ResourceType,
        id: &str,
        inputs: &Inputs,
    ) -> Result<Outputs, ProviderError> {
        let mut inner = self.lock();
        inner.log.push(format!("update {ty}"));
        inner.check_failure(ty, "update")?;

        let Some(entry) = inner.live.get_mut(id) else {
            return Err(ProviderError::Permanent(format!("no such resource: {id}")));
        };
        entry.1 = inputs.clone();

        let mut outputs = inputs.clone();
        outputs.insert("id".to_string(), json!(id));
        Ok(outputs)
    }

    async fn delete(&self, ty: &ResourceType, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        inner.log.push(format!("delete {ty}"));
        inner.check_failure(ty, "delete")?;

        if inner.live.shift_remove(id).is_none() {
            return Err(ProviderError::Permanent(format!("no such resource: {id}")));
        }
        Ok(())
    }

    fn replacement_policy(&self, ty: &ResourceType) -> ReplacementPolicy {
        self.policies.get(ty).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(name: &str) -> ResourceType {
        ResourceType::new(name)
    }

    #[tokio::test]
    async fn create_update_delete_round_trip() {
        let provider = MemoryProvider::new();
        let inputs = Inputs::from([("location".to_string(), json!("westeurope"))]);

        let (outputs, id) = provider.create(&ty("rg"), &inputs).await.unwrap();
        assert_eq!(outputs.get("location"), Some(&json!("westeurope")));
        assert_eq!(outputs.get("id"), Some(&json!(id.clone())));

        let changed = Inputs::from([("location".to_string(), json!("northeurope"))]);
        provider.update(&ty("rg"), &id, &changed).await.unwrap();
        assert_eq!(provider.live()[0].2, changed);

        provider.delete(&ty("rg"), &id).await.unwrap();
        assert!(provider.live().is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_expire() {
        let provider = MemoryProvider::new();
        provider.fail_times(ty("rg"), ProviderError::Transient("429".into()), 2);

        let inputs = Inputs::new();
        assert!(provider.create(&ty("rg"), &inputs).await.is_err());
        assert!(provider.create(&ty("rg"), &inputs).await.is_err());
        assert!(provider.create(&ty("rg"), &inputs).await.is_ok());
    }

    #[tokio::test]
    async fn op_scoped_failures_spare_other_operations() {
        let provider = MemoryProvider::new();
        provider.fail_op(ty("rg"), "delete", ProviderError::Permanent("locked".into()));

        let (_, id) = provider.create(&ty("rg"), &Inputs::new()).await.unwrap();
        assert!(provider.delete(&ty("rg"), &id).await.is_err());

        provider.clear_failures(&ty("rg"));
        assert!(provider.delete(&ty("rg"), &id).await.is_ok());
    }

    #[tokio::test]
    async fn deleting_unknown_resource_is_permanent() {
        let provider = MemoryProvider::new();
        let error = provider.delete(&ty("rg"), "mem-404").await.unwrap_err();
        assert!(!error.is_transient());
    }
}
