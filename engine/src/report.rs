use std::fmt::Display;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use veld_resource::ResourceId;

/// Where a resource is in its run lifecycle.
///
/// `Succeeded`, `Failed` and `Skipped` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Pending,
    /// Blocked on upstream outputs.
    Waiting,
    /// Provider operation in flight.
    Executing,
    Succeeded,
    Failed { error: String },
    /// A dependency failed (or the run was cancelled); the operation
    /// was never dispatched.
    Skipped,
}

impl Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Pending => write!(f, "pending"),
            ResourceStatus::Waiting => write!(f, "waiting"),
            ResourceStatus::Executing => write!(f, "executing"),
            ResourceStatus::Succeeded => write!(f, "succeeded"),
            ResourceStatus::Failed { error } => write!(f, "failed: {error}"),
            ResourceStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-resource outcome of a run, in plan order.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub statuses: IndexMap<ResourceId, ResourceStatus>,
}

impl ApplyReport {
    /// True only if every resource reached `Succeeded`.
    pub fn all_succeeded(&self) -> bool {
        self.statuses
            .values()
            .all(|status| *status == ResourceStatus::Succeeded)
    }

    pub fn status(&self, id: &ResourceId) -> Option<&ResourceStatus> {
        self.statuses.get(id)
    }

    pub fn count(&self, wanted: fn(&ResourceStatus) -> bool) -> usize {
        self.statuses.values().filter(|s| wanted(s)).count()
    }
}

/// Shared live status table, updated by executor tasks.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusTable(Arc<Mutex<IndexMap<ResourceId, ResourceStatus>>>);

impl StatusTable {
    pub(crate) fn seed(&self, id: &ResourceId) {
        self.set(id, ResourceStatus::Pending);
    }

    pub(crate) fn set(&self, id: &ResourceId, status: ResourceStatus) {
        let mut statuses = self.0.lock().expect("status table lock poisoned");
        statuses.insert(id.clone(), status);
    }

    pub(crate) fn into_report(self) -> ApplyReport {
        let statuses = self.0.lock().expect("status table lock poisoned").clone();
        ApplyReport { statuses }
    }
}
