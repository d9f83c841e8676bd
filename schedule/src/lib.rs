use std::collections::{BTreeMap, BTreeSet, VecDeque};

use displaydoc::Display;
use thiserror::Error;
use veld_graph::Graph;
use veld_resource::ResourceId;

#[derive(Debug, Clone, Error, Display)]
pub enum ScheduleError {
    /// Cycle detected in dependency graph (remaining nodes: {remaining})
    CycleDetected { remaining: usize },
}

/// An ordered sequence of waves. Resources within a wave share no
/// dependency edges and are eligible for parallel execution; every
/// dependency of a wave-k resource sits in a wave before k.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waves(pub Vec<Vec<ResourceId>>);

impl Waves {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<ResourceId>> {
        self.0.iter()
    }

    /// Wave index of a resource, if scheduled.
    pub fn wave_of(&self, id: &ResourceId) -> Option<usize> {
        self.0
            .iter()
            .position(|wave| wave.iter().any(|wave_id| wave_id == id))
    }
}

/// Compute an execution plan for a graph.
pub fn schedule(graph: &Graph) -> Result<Waves, ScheduleError> {
    let mut dependencies: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();
    for (index, node) in graph.nodes().iter().enumerate() {
        let deps = graph
            .dependencies_of(index)
            .iter()
            .map(|&dep| graph.node(dep).id.clone())
            .collect();
        dependencies.insert(node.id.clone(), deps);
    }
    layer(&dependencies)
}

/// Layer nodes by in-degree (Kahn's algorithm, grouped per
/// generation). Dependencies not present in the map are ignored, so
/// callers can schedule a subset of a larger graph. Each wave is
/// sorted by identity string, keeping plans deterministic and
/// diffable between runs.
pub fn layer(
    dependencies: &BTreeMap<ResourceId, BTreeSet<ResourceId>>,
) -> Result<Waves, ScheduleError> {
    let n = dependencies.len();
    let mut indegree: BTreeMap<&ResourceId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();

    for (id, deps) in dependencies {
        let present: Vec<&ResourceId> = deps
            .iter()
            .filter(|dep| dependencies.contains_key(*dep))
            .collect();
        indegree.insert(id, present.len());
        for dep in present {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut queue: VecDeque<&ResourceId> = indegree
        .iter()
        .filter_map(|(&id, &degree)| (degree == 0).then_some(id))
        .collect();

    let mut seen = 0usize;
    let mut waves: Vec<Vec<ResourceId>> = Vec::new();

    while !queue.is_empty() {
        let mut wave: Vec<&ResourceId> = queue.drain(..).collect();
        wave.sort();
        seen += wave.len();

        let mut next_wave: Vec<&ResourceId> = Vec::new();
        for &id in &wave {
            for &dependent in dependents.get(id).into_iter().flatten() {
                let degree = indegree
                    .get_mut(dependent)
                    .expect("dependent is a known node");
                *degree -= 1;
                if *degree == 0 {
                    next_wave.push(dependent);
                }
            }
        }

        waves.push(wave.into_iter().cloned().collect());
        queue.extend(next_wave);
    }

    if seen != n {
        return Err(ScheduleError::CycleDetected { remaining: n - seen });
    }

    Ok(Waves(waves))
}

#[cfg(test)]
mod tests {
    use veld_graph::{build, Definition};

    use super::*;

    fn rid(name: &str) -> ResourceId {
        ResourceId::new("test:thing", name)
    }

    fn chain() -> Graph {
        build(vec![
            Definition::new(rid("rg")),
            Definition::new(rid("sql")).depends_on(rid("rg")),
            Definition::new(rid("db")).depends_on(rid("sql")),
        ])
        .unwrap()
    }

    #[test]
    fn chain_schedules_one_resource_per_wave() {
        let waves = schedule(&chain()).unwrap();
        assert_eq!(
            waves,
            Waves(vec![vec![rid("rg")], vec![rid("sql")], vec![rid("db")]])
        );
    }

    #[test]
    fn every_edge_points_to_an_earlier_wave() {
        let graph = build(vec![
            Definition::new(rid("a")),
            Definition::new(rid("b")),
            Definition::new(rid("c")).depends_on(rid("a")).depends_on(rid("b")),
            Definition::new(rid("d")).depends_on(rid("a")),
            Definition::new(rid("e")).depends_on(rid("c")),
        ])
        .unwrap();
        let waves = schedule(&graph).unwrap();

        for (index, node) in graph.nodes().iter().enumerate() {
            let wave = waves.wave_of(&node.id).unwrap();
            for &dep in graph.dependencies_of(index) {
                let dep_wave = waves.wave_of(&graph.node(dep).id).unwrap();
                assert!(dep_wave < wave, "{} not before {}", graph.node(dep).id, node.id);
            }
        }
    }

    #[test]
    fn independent_resources_share_a_wave_in_stable_order() {
        let graph = build(vec![
            Definition::new(rid("zeta")),
            Definition::new(rid("alpha")),
            Definition::new(rid("mid")),
        ])
        .unwrap();
        let waves = schedule(&graph).unwrap();
        assert_eq!(waves, Waves(vec![vec![rid("alpha"), rid("mid"), rid("zeta")]]));
    }

    #[test]
    fn layering_a_subset_ignores_outside_dependencies() {
        let dependencies = BTreeMap::from([
            (rid("kept"), BTreeSet::from([rid("absent")])),
            (rid("other"), BTreeSet::new()),
        ]);
        let waves = layer(&dependencies).unwrap();
        assert_eq!(waves.len(), 1);
    }

    #[test]
    fn cycle_is_detected() {
        let dependencies = BTreeMap::from([
            (rid("a"), BTreeSet::from([rid("b")])),
            (rid("b"), BTreeSet::from([rid("a")])),
        ]);
        assert!(matches!(
            layer(&dependencies),
            Err(ScheduleError::CycleDetected { remaining: 2 })
        ));
    }
}
