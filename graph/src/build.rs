use std::collections::{BTreeSet, HashMap};

use displaydoc::Display as DisplayDoc;
use thiserror::Error;
use veld_resource::ResourceId;

use crate::definition::Definition;

/// The graph is not a DAG. `path` lists the cycle, with the entry
/// resource repeated at the end.
#[derive(Debug, Clone, Error)]
#[error("dependency cycle: {}", .path.iter().map(ResourceId::to_string).collect::<Vec<_>>().join(" -> "))]
pub struct CycleError {
    pub path: Vec<ResourceId>,
}

#[derive(Debug, Clone, Error, DisplayDoc)]
pub enum BuildError {
    /// Duplicate resource definition: {0}
    Duplicate(ResourceId),
    /// {from} references unknown resource {to}
    UnknownReference { from: ResourceId, to: ResourceId },
    /// {0}
    Cycle(#[from] CycleError),
}

/// Directed acyclic graph of resource definitions.
///
/// An arena of nodes addressed by integer index, with adjacency lists
/// in both directions. Edge `(a, b)` (b in `dependencies_of(a)`) means
/// b must be applied before a.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Definition>,
    index: HashMap<ResourceId, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
}

impl Graph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Definition] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Definition {
        &self.nodes[index]
    }

    pub fn index_of(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn definition(&self, id: &ResourceId) -> Option<&Definition> {
        self.index_of(id).map(|index| self.node(index))
    }

    pub fn dependencies_of(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependencies[index]
    }

    pub fn dependents_of(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependents[index]
    }

    /// Dependency identities of a resource, for state records.
    pub fn dependency_ids(&self, id: &ResourceId) -> BTreeSet<ResourceId> {
        match self.index_of(id) {
            Some(index) => self.dependencies[index]
                .iter()
                .map(|&dep| self.nodes[dep].id.clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }
}

/// Build a graph from definitions.
///
/// Edges come from output references in inputs, explicit `depends_on`,
/// and parent scoping. A child without a `tags` input inherits its
/// parent's. Fails with the full cycle path if the result is not a
/// DAG.
pub fn build(definitions: Vec<Definition>) -> Result<Graph, BuildError> {
    let mut index: HashMap<ResourceId, usize> = HashMap::with_capacity(definitions.len());
    for (i, definition) in definitions.iter().enumerate() {
        if index.insert(definition.id.clone(), i).is_some() {
            return Err(BuildError::Duplicate(definition.id.clone()));
        }
    }

    let mut nodes = definitions;
    inherit_tags(&mut nodes, &index);

    let n = nodes.len();
    let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];

    for i in 0..n {
        let mut edges: BTreeSet<ResourceId> = BTreeSet::new();
        for input in nodes[i].inputs.values() {
            edges.extend(input.dependencies());
        }
        edges.extend(nodes[i].depends_on.iter().cloned());
        if let Some(parent) = &nodes[i].parent {
            edges.insert(parent.clone());
        }

        for dep_id in edges {
            let Some(&dep) = index.get(&dep_id) else {
                return Err(BuildError::UnknownReference {
                    from: nodes[i].id.clone(),
                    to: dep_id,
                });
            };
            if dep == i {
                return Err(CycleError {
                    path: vec![nodes[i].id.clone(), nodes[i].id.clone()],
                }
                .into());
            }
            dependencies[i].insert(dep);
            dependents[dep].insert(i);
        }
    }

    let graph = Graph {
        nodes,
        index,
        dependencies,
        dependents,
    };
    check_acyclic(&graph)?;
    Ok(graph)
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Coloring DFS over dependency edges.
fn check_acyclic(graph: &Graph) -> Result<(), CycleError> {
    let n = graph.len();
    let mut colors = vec![Color::White; n];
    let mut path: Vec<usize> = Vec::new();

    fn visit(
        graph: &Graph,
        node: usize,
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Result<(), CycleError> {
        colors[node] = Color::Gray;
        path.push(node);

        for &dep in graph.dependencies_of(node) {
            match colors[dep] {
                Color::Black => {}
                Color::White => visit(graph, dep, colors, path)?,
                Color::Gray => {
                    let start = path
                        .iter()
                        .position(|&p| p == dep)
                        .unwrap_or(path.len() - 1);
                    let mut cycle: Vec<ResourceId> = path[start..]
                        .iter()
                        .map(|&p| graph.node(p).id.clone())
                        .collect();
                    cycle.push(graph.node(dep).id.clone());
                    return Err(CycleError { path: cycle });
                }
            }
        }

        path.pop();
        colors[node] = Color::Black;
        Ok(())
    }

    for node in 0..n {
        if colors[node] == Color::White {
            visit(graph, node, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

/// A child without a `tags` input inherits its parent's, transitively.
fn inherit_tags(nodes: &mut [Definition], index: &HashMap<ResourceId, usize>) {
    for i in 0..nodes.len() {
        if nodes[i].inputs.contains_key("tags") {
            continue;
        }
        let mut seen: BTreeSet<usize> = BTreeSet::from([i]);
        let mut current = i;
        while let Some(parent) = nodes[current]
            .parent
            .as_ref()
            .and_then(|id| index.get(id).copied())
        {
            if !seen.insert(parent) {
                // Parent cycle; the DFS will report it.
                break;
            }
            if let Some(tags) = nodes[parent].inputs.get("tags").cloned() {
                nodes[i].inputs.insert("tags".to_string(), tags);
                break;
            }
            current = parent;
        }
    }
}
