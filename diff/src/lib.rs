use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use thiserror::Error;
use veld_graph::{Definition, Graph};
use veld_output::Projection;
use veld_provider::{ProviderClient, ReplacementPolicy};
use veld_resource::{ResourceId, ResourceType};
use veld_schedule::{layer, ScheduleError, Waves};
use veld_state::{digest, StateSnapshot};

/// Ordering of the two operations making up a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOrder {
    /// The type supports two live instances; avoid downtime.
    CreateBeforeDelete,
    /// The identity is globally unique (e.g. a DNS name).
    DeleteBeforeCreate,
}

/// Per-resource diff classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffAction {
    Create,
    NoOp,
    Update { changed: BTreeSet<String> },
    Replace {
        changed: BTreeSet<String>,
        order: ReplaceOrder,
    },
}

impl DiffAction {
    pub fn is_noop(&self) -> bool {
        matches!(self, DiffAction::NoOp)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            DiffAction::Create => "+",
            DiffAction::NoOp => "=",
            DiffAction::Update { .. } => "~",
            DiffAction::Replace { .. } => "±",
        }
    }
}

/// A resource scheduled for apply, annotated with its classification.
#[derive(Debug, Clone)]
pub struct PlannedResource {
    pub id: ResourceId,
    pub definition: Definition,
    pub action: DiffAction,
    pub dependencies: BTreeSet<ResourceId>,
    /// Provider id from state, present unless this is a create.
    pub provider_id: Option<String>,
    /// Superseded instance a previous replacement failed to delete.
    pub pending_delete: Option<String>,
}

/// A resource present in state but absent from the definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStep {
    pub id: ResourceId,
    pub ty: ResourceType,
    pub provider_id: String,
    /// Superseded instance a previous replacement failed to delete.
    pub pending_delete: Option<String>,
}

/// The annotated execution plan: apply waves in dependency order, then
/// delete waves in reverse dependency order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub waves: Vec<Vec<PlannedResource>>,
    pub deletes: Vec<Vec<DeleteStep>>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.deletes.is_empty()
            && self.waves.iter().flatten().all(|planned| {
                planned.action.is_noop() && planned.pending_delete.is_none()
            })
    }

    pub fn resources(&self) -> impl Iterator<Item = &PlannedResource> {
        self.waves.iter().flatten()
    }
}

#[derive(Debug, Error)]
pub enum DiffError {
    /// Recorded dependency ids of deleted resources form a cycle, which
    /// means the state file was edited by hand.
    #[error("state dependency records are cyclic")]
    StaleState(#[from] ScheduleError),
}

/// Classify every scheduled resource against recorded state.
///
/// Walks waves in order so that a downstream input referencing an
/// upstream output can be projected: a no-op upstream projects to its
/// recorded value, anything else projects to unknown (conservatively
/// treated as changed).
#[tracing::instrument(skip_all)]
pub fn plan(
    graph: &Graph,
    waves: &Waves,
    state: &StateSnapshot,
    provider: &dyn ProviderClient,
) -> Result<Plan, DiffError> {
    let mut actions: IndexMap<ResourceId, DiffAction> = IndexMap::new();
    let mut planned_waves: Vec<Vec<PlannedResource>> = Vec::with_capacity(waves.len());

    for wave in waves.iter() {
        let mut planned_wave = Vec::with_capacity(wave.len());
        for id in wave {
            let definition = graph
                .definition(id)
                .expect("scheduled resource is in the graph");
            let action = classify(definition, state, &actions, provider);
            tracing::debug!(resource = %id, action = action.symbol(), "classified");

            let record = state.record(id);
            actions.insert(id.clone(), action.clone());
            planned_wave.push(PlannedResource {
                id: id.clone(),
                definition: definition.clone(),
                action,
                dependencies: graph.dependency_ids(id),
                provider_id: record.map(|record| record.provider_id.clone()),
                pending_delete: record.and_then(|record| record.pending_delete.clone()),
            });
        }
        planned_waves.push(planned_wave);
    }

    let deletes = plan_deletes(graph, state)?;
    Ok(Plan {
        waves: planned_waves,
        deletes,
    })
}

/// Plan a full teardown: every recorded resource classified delete, in
/// reverse dependency order.
pub fn destroy_plan(state: &StateSnapshot) -> Result<Plan, DiffError> {
    let all: BTreeSet<ResourceId> = state.records.keys().cloned().collect();
    Ok(Plan {
        waves: Vec::new(),
        deletes: delete_waves(state, &all)?,
    })
}

fn classify(
    definition: &Definition,
    state: &StateSnapshot,
    actions: &IndexMap<ResourceId, DiffAction>,
    provider: &dyn ProviderClient,
) -> DiffAction {
    let Some(record) = state.record(&definition.id) else {
        return DiffAction::Create;
    };

    let lookup = |resource: &ResourceId, property: &str| -> Projection {
        match actions.get(resource) {
            Some(DiffAction::NoOp) => match state.output(resource, property) {
                Some((value, secret)) => Projection::Known {
                    value: value.clone(),
                    secret: *secret,
                },
                None => Projection::Unknown,
            },
            _ => Projection::Unknown,
        }
    };

    let mut changed: BTreeSet<String> = BTreeSet::new();
    for (property, input) in &definition.inputs {
        let projected = match input.project(&lookup) {
            Projection::Known { value, .. } => Some(digest(&value)),
            Projection::Unknown => None,
        };
        if projected.as_ref() != record.inputs.get(property) {
            changed.insert(property.clone());
        }
    }
    // Properties dropped from the definition count as changed too.
    for property in record.inputs.keys() {
        if !definition.inputs.contains_key(property) {
            changed.insert(property.clone());
        }
    }

    let current_deps: BTreeSet<ResourceId> = definition
        .inputs
        .values()
        .flat_map(|input| input.dependencies())
        .chain(definition.depends_on.iter().cloned())
        .chain(definition.parent.iter().cloned())
        .collect();

    if changed.is_empty() && current_deps == record.dependency_ids {
        return DiffAction::NoOp;
    }

    let policy = provider.replacement_policy(&definition.id.ty);
    if changed.iter().any(|p| policy.forces_replacement.contains(p)) {
        DiffAction::Replace {
            changed,
            order: replace_order(&policy),
        }
    } else {
        DiffAction::Update { changed }
    }
}

fn replace_order(policy: &ReplacementPolicy) -> ReplaceOrder {
    if policy.supports_coexistence {
        ReplaceOrder::CreateBeforeDelete
    } else {
        ReplaceOrder::DeleteBeforeCreate
    }
}

fn plan_deletes(graph: &Graph, state: &StateSnapshot) -> Result<Vec<Vec<DeleteStep>>, DiffError> {
    let doomed: BTreeSet<ResourceId> = state
        .records
        .keys()
        .filter(|id| graph.definition(id).is_none())
        .cloned()
        .collect();
    delete_waves(state, &doomed)
}

/// Waves of deletions: dependents before their dependencies.
fn delete_waves(
    state: &StateSnapshot,
    doomed: &BTreeSet<ResourceId>,
) -> Result<Vec<Vec<DeleteStep>>, DiffError> {
    if doomed.is_empty() {
        return Ok(Vec::new());
    }

    let mut dependencies: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();
    for id in doomed {
        let deps = state
            .record(id)
            .map(|record| {
                record
                    .dependency_ids
                    .iter()
                    .filter(|dep| doomed.contains(*dep))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        dependencies.insert(id.clone(), deps);
    }

    let layered = layer(&dependencies)?;
    let mut waves: Vec<Vec<DeleteStep>> = layered
        .iter()
        .map(|wave| {
            wave.iter()
                .filter_map(|id| {
                    let record = state.record(id)?;
                    Some(DeleteStep {
                        id: id.clone(),
                        ty: id.ty.clone(),
                        provider_id: record.provider_id.clone(),
                        pending_delete: record.pending_delete.clone(),
                    })
                })
                .collect()
        })
        .collect();
    waves.reverse();
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;
    use veld_graph::{build, Input};
    use veld_output::Output;
    use veld_provider::MemoryProvider;
    use veld_schedule::schedule;
    use veld_state::SnapshotRecord;

    use super::*;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("test:thing", name)
    }

    fn definitions() -> Vec<Definition> {
        vec![
            Definition::new(rid("rg")).input("location", Input::literal(json!("westeurope"))),
            Definition::new(rid("sql"))
                .input("group", Input::output(Output::property(rid("rg"), "name"))),
            Definition::new(rid("db")).depends_on(rid("sql")),
        ]
    }

    fn snapshot_for_definitions() -> StateSnapshot {
        let mut state = StateSnapshot::default();
        state.records.insert(
            rid("rg"),
            SnapshotRecord {
                provider_id: "mem-1".to_string(),
                inputs: IndexMap::from([("location".to_string(), digest(&json!("westeurope")))]),
                outputs: IndexMap::from([("name".to_string(), (json!("rg-prod"), false))]),
                dependency_ids: BTreeSet::new(),
                pending_delete: None,
            },
        );
        state.records.insert(
            rid("sql"),
            SnapshotRecord {
                provider_id: "mem-2".to_string(),
                inputs: IndexMap::from([("group".to_string(), digest(&json!("rg-prod")))]),
                outputs: IndexMap::new(),
                dependency_ids: BTreeSet::from([rid("rg")]),
                pending_delete: None,
            },
        );
        state.records.insert(
            rid("db"),
            SnapshotRecord {
                provider_id: "mem-3".to_string(),
                inputs: IndexMap::new(),
                outputs: IndexMap::new(),
                dependency_ids: BTreeSet::from([rid("sql")]),
                pending_delete: None,
            },
        );
        state
    }

    fn plan_for(definitions: Vec<Definition>, state: &StateSnapshot) -> Plan {
        let graph = build(definitions).unwrap();
        let waves = schedule(&graph).unwrap();
        plan(&graph, &waves, state, &MemoryProvider::new()).unwrap()
    }

    #[test]
    fn fresh_state_creates_everything_in_wave_order() {
        let result = plan_for(definitions(), &StateSnapshot::default());

        let ids: Vec<Vec<ResourceId>> = result
            .waves
            .iter()
            .map(|wave| wave.iter().map(|p| p.id.clone()).collect())
            .collect();
        assert_eq!(ids, vec![vec![rid("rg")], vec![rid("sql")], vec![rid("db")]]);
        assert!(result
            .resources()
            .all(|planned| planned.action == DiffAction::Create));
        assert!(result.deletes.is_empty());
    }

    #[test]
    fn unchanged_definitions_plan_as_all_noop() {
        let result = plan_for(definitions(), &snapshot_for_definitions());
        assert!(result.is_noop(), "expected all no-op, got {result:?}");
    }

    #[test]
    fn changed_literal_input_is_an_update_naming_the_property() {
        let mut defs = definitions();
        defs[0] = Definition::new(rid("rg")).input("location", Input::literal(json!("northeurope")));
        let result = plan_for(defs, &snapshot_for_definitions());

        let rg = result.resources().find(|p| p.id == rid("rg")).unwrap();
        assert_eq!(
            rg.action,
            DiffAction::Update {
                changed: BTreeSet::from(["location".to_string()])
            }
        );
        // Downstream of an updated resource projects unknown: update.
        let sql = result.resources().find(|p| p.id == rid("sql")).unwrap();
        assert!(matches!(sql.action, DiffAction::Update { .. }));
    }

    #[test]
    fn forced_replacement_follows_coexistence_policy() {
        let mut defs = definitions();
        defs[0] = Definition::new(rid("rg")).input("location", Input::literal(json!("northeurope")));
        let graph = build(defs).unwrap();
        let waves = schedule(&graph).unwrap();
        let state = snapshot_for_definitions();

        let coexisting = MemoryProvider::new().with_policy(
            ResourceType::new("test:thing"),
            ReplacementPolicy {
                forces_replacement: BTreeSet::from(["location".to_string()]),
                supports_coexistence: true,
            },
        );
        let result = plan(&graph, &waves, &state, &coexisting).unwrap();
        let rg = result.resources().find(|p| p.id == rid("rg")).unwrap();
        assert!(matches!(
            rg.action,
            DiffAction::Replace {
                order: ReplaceOrder::CreateBeforeDelete,
                ..
            }
        ));

        let exclusive = MemoryProvider::new().with_policy(
            ResourceType::new("test:thing"),
            ReplacementPolicy {
                forces_replacement: BTreeSet::from(["location".to_string()]),
                supports_coexistence: false,
            },
        );
        let result = plan(&graph, &waves, &state, &exclusive).unwrap();
        let rg = result.resources().find(|p| p.id == rid("rg")).unwrap();
        assert!(matches!(
            rg.action,
            DiffAction::Replace {
                order: ReplaceOrder::DeleteBeforeCreate,
                ..
            }
        ));
    }

    #[test]
    fn leftover_pending_delete_keeps_the_plan_actionable() {
        let mut state = snapshot_for_definitions();
        state.records.get_mut(&rid("rg")).unwrap().pending_delete = Some("mem-9".to_string());
        let result = plan_for(definitions(), &state);

        let rg = result.resources().find(|p| p.id == rid("rg")).unwrap();
        assert_eq!(rg.action, DiffAction::NoOp);
        assert_eq!(rg.pending_delete, Some("mem-9".to_string()));
        assert!(!result.is_noop());
    }

    #[test]
    fn dependency_set_change_alone_forces_an_update() {
        let mut defs = definitions();
        defs[2] = Definition::new(rid("db")).depends_on(rid("rg"));
        let result = plan_for(defs, &snapshot_for_definitions());

        let db = result.resources().find(|p| p.id == rid("db")).unwrap();
        assert_eq!(
            db.action,
            DiffAction::Update {
                changed: BTreeSet::new()
            }
        );
    }

    #[test]
    fn state_only_resources_are_deleted_dependents_first() {
        let state = snapshot_for_definitions();
        let result = plan_for(vec![definitions().remove(0)], &state);

        let waves: Vec<Vec<ResourceId>> = result
            .deletes
            .iter()
            .map(|wave| wave.iter().map(|step| step.id.clone()).collect())
            .collect();
        assert_eq!(waves, vec![vec![rid("db")], vec![rid("sql")]]);
    }

    #[test]
    fn destroy_plans_every_record_in_reverse_order() {
        let result = destroy_plan(&snapshot_for_definitions()).unwrap();
        assert!(result.waves.is_empty());

        let waves: Vec<Vec<ResourceId>> = result
            .deletes
            .iter()
            .map(|wave| wave.iter().map(|step| step.id.clone()).collect())
            .collect();
        assert_eq!(
            waves,
            vec![vec![rid("db")], vec![rid("sql")], vec![rid("rg")]]
        );
    }
}
