use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use tokio::sync::watch;
use veld_resource::ResourceId;

use crate::Value;

/// The outputs a resource produced on a successful apply.
///
/// `all_secret` is the resolve-time secret override: when set, every
/// property of the resource is treated as secret regardless of flags.
#[derive(Debug, Clone, Default)]
pub struct ResolvedOutputs {
    pub values: IndexMap<String, Value>,
    pub secret_props: BTreeSet<String>,
    pub all_secret: bool,
}

impl ResolvedOutputs {
    pub fn is_secret(&self, property: &str) -> bool {
        self.all_secret || self.secret_props.contains(property)
    }
}

/// Per-resource resolution slot.
#[derive(Debug, Clone)]
pub enum Slot {
    Pending,
    Resolved(ResolvedOutputs),
    Failed,
}

/// Tracks one resolution slot per resource for the duration of a run.
///
/// The executor calls [`OutputResolver::resolve`] or
/// [`OutputResolver::fail`] exactly once per resource; every output
/// bound to that resource (and every waiter blocked on it) observes the
/// transition through a watch channel.
#[derive(Debug, Clone, Default)]
pub struct OutputResolver {
    slots: Arc<Mutex<HashMap<ResourceId, watch::Sender<Slot>>>>,
}

impl OutputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition all outputs bound to `resource` to resolved.
    pub fn resolve(&self, resource: &ResourceId, outputs: ResolvedOutputs) {
        self.with_sender(resource, |sender| {
            sender.send_replace(Slot::Resolved(outputs));
        });
    }

    /// Mark `resource` failed, releasing waiters with [`Slot::Failed`].
    pub fn fail(&self, resource: &ResourceId) {
        self.with_sender(resource, |sender| {
            sender.send_replace(Slot::Failed);
        });
    }

    /// Wait until `resource` leaves the pending state.
    pub async fn wait(&self, resource: &ResourceId) -> Slot {
        let mut receiver = self.with_sender(resource, |sender| sender.subscribe());
        let slot = receiver
            .wait_for(|slot| !matches!(slot, Slot::Pending))
            .await;
        match slot {
            Ok(slot) => slot.clone(),
            // Sender side gone: the run is tearing down.
            Err(_) => Slot::Failed,
        }
    }

    fn with_sender<T>(
        &self,
        resource: &ResourceId,
        f: impl FnOnce(&watch::Sender<Slot>) -> T,
    ) -> T {
        let mut slots = self.slots.lock().expect("resolver lock poisoned");
        let sender = slots
            .entry(resource.clone())
            .or_insert_with(|| watch::channel(Slot::Pending).0);
        f(sender)
    }
}
