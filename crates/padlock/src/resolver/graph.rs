//! Post-solve traversals over the dependency graph: merging environment
//! markers down parent edges and inferring the dependency groups every
//! pinned candidate belongs to.

use super::engine::ResolutionResult;
use crate::types::Marker;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};

/// The dependency graph in arena form: node indices into `identifiers`,
/// parent edges as `(parent_index, edge_marker)` pairs. `None` as a parent
/// stands for the root (a user requirement).
pub struct DependencyGraph {
    identifiers: Vec<String>,
    index_of: HashMap<String, usize>,
    /// Parent edges per node; the marker is the one written on the edge's
    /// requirement.
    parents: Vec<Vec<(ParentRef, Option<Marker>, Vec<String>)>>,
}

/// Where an edge comes from: the user's requirements, another pinned node,
/// or a pin that is no longer part of the result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ParentRef {
    Root,
    Node(usize),
    Missing,
}

impl DependencyGraph {
    /// Builds the arena from a resolution result. Only pinned identifiers
    /// become nodes; parents that were never pinned are treated as roots.
    pub fn new(result: &ResolutionResult) -> Self {
        let identifiers: Vec<String> = result.mapping.keys().cloned().collect();
        let index_of: HashMap<String, usize> = identifiers
            .iter()
            .enumerate()
            .map(|(index, id)| (id.clone(), index))
            .collect();
        let mut parents = vec![Vec::new(); identifiers.len()];
        for (identifier, index) in &index_of {
            let Some(criterion) = result.criteria.get(identifier) else {
                continue;
            };
            for info in &criterion.information {
                let parent_ref = match &info.parent {
                    None => ParentRef::Root,
                    Some(parent) => match index_of.get(&parent.identify()) {
                        Some(parent_index) => ParentRef::Node(*parent_index),
                        None => ParentRef::Missing,
                    },
                };
                parents[*index].push((
                    parent_ref,
                    info.requirement.marker().cloned(),
                    info.requirement.core().groups.clone(),
                ));
            }
        }
        DependencyGraph {
            identifiers,
            index_of,
            parents,
        }
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    fn identifier(&self, index: usize) -> &str {
        &self.identifiers[index]
    }
}

/// Merges parent markers into each pinned candidate:
/// `marker(c) = ⋁ over parents p of (marker(p) ∧ edge_marker(p → c))`, with
/// the root marker being universally true. Proceeds as a work list until no
/// progress is made, then breaks circular clusters by letting their members
/// resolve against whatever their parents have so far.
pub fn merge_markers(result: &ResolutionResult) -> IndexMap<String, Marker> {
    let graph = DependencyGraph::new(result);
    let mut all_markers: IndexMap<String, Marker> = IndexMap::new();
    let mut unresolved: IndexSet<usize> = (0..graph.len()).collect();
    let mut circular: IndexMap<usize, IndexSet<usize>> = IndexMap::new();

    while !unresolved.is_empty() {
        let mut new_markers: IndexMap<usize, Marker> = IndexMap::new();
        for &node in &unresolved {
            let keep_unresolved = circular.get(&node).cloned().unwrap_or_default();
            // every parent must be resolved before this node can be
            let blocked = graph.parents[node].iter().any(|(parent, _, _)| {
                matches!(parent, ParentRef::Node(p)
                    if unresolved.contains(p) && !keep_unresolved.contains(p))
            });
            if blocked {
                continue;
            }
            new_markers.insert(
                node,
                build_marker(&graph, node, &all_markers, &keep_unresolved),
            );
        }

        if new_markers.is_empty() {
            // no progress: a circular cluster. Pick one member and allow it
            // to ignore its unresolved parents for now; a second pass below
            // reconverges it.
            let Some(&node) = unresolved.iter().find(|n| !circular.contains_key(*n)) else {
                break;
            };
            let unresolved_parents: IndexSet<usize> = graph.parents[node]
                .iter()
                .filter_map(|(parent, _, _)| match parent {
                    ParentRef::Node(p) => Some(*p),
                    _ => None,
                })
                .filter(|p| unresolved.contains(p) && *p != node)
                .collect();
            circular.insert(node, unresolved_parents);
        } else {
            for (node, marker) in new_markers {
                all_markers.insert(graph.identifier(node).to_string(), marker);
                unresolved.shift_remove(&node);
            }
        }
    }

    // fixup pass: circular members recompute with every parent's (possibly
    // partial) marker now available
    for &node in circular.keys() {
        let marker = build_marker(&graph, node, &all_markers, &IndexSet::new());
        all_markers.insert(graph.identifier(node).to_string(), marker);
    }

    all_markers
}

fn build_marker(
    graph: &DependencyGraph,
    node: usize,
    resolved: &IndexMap<String, Marker>,
    keep_unresolved: &IndexSet<usize>,
) -> Marker {
    let mut merged: Option<Marker> = None;
    for (parent, edge_marker, _) in &graph.parents[node] {
        let parent_marker = match parent {
            ParentRef::Root => Marker::any(),
            ParentRef::Missing => continue,
            ParentRef::Node(parent_index) => {
                if keep_unresolved.contains(parent_index) {
                    continue;
                }
                match resolved.get(graph.identifier(*parent_index)) {
                    Some(marker) => marker.clone(),
                    None => continue,
                }
            }
        };
        let edge = edge_marker.clone().unwrap_or_else(Marker::any);
        // `and` joins the edge with its parent, `or` joins across parents
        let combined = &edge & &parent_marker;
        merged = Some(match merged {
            None => combined,
            Some(current) => &current | &combined,
        });
    }
    merged.unwrap_or_else(Marker::any)
}

/// Infers the dependency groups of every pinned candidate: the union of the
/// groups on all requirement edges leading to it, transitively through its
/// parents.
pub fn inherited_groups(result: &ResolutionResult) -> IndexMap<String, Vec<String>> {
    let graph = DependencyGraph::new(result);
    let mut resolved: HashMap<usize, HashSet<String>> = HashMap::new();

    fn groups_of(
        graph: &DependencyGraph,
        node: usize,
        resolved: &mut HashMap<usize, HashSet<String>>,
        visiting: &mut HashSet<usize>,
    ) -> HashSet<String> {
        if let Some(found) = resolved.get(&node) {
            return found.clone();
        }
        if !visiting.insert(node) {
            // a cycle member contributes what is known so far
            return HashSet::new();
        }
        let mut groups: HashSet<String> = HashSet::new();
        for (parent, _, edge_groups) in &graph.parents[node] {
            groups.extend(edge_groups.iter().cloned());
            if let ParentRef::Node(parent_index) = parent {
                groups.extend(groups_of(graph, *parent_index, resolved, visiting));
            }
        }
        visiting.remove(&node);
        resolved.insert(node, groups.clone());
        groups
    }

    let mut out = IndexMap::new();
    for node in 0..graph.len() {
        let mut visiting = HashSet::new();
        let mut groups: Vec<String> =
            groups_of(&graph, node, &mut resolved, &mut visiting)
                .into_iter()
                .collect();
        groups.sort_by(|a, b| group_sort_key(a).cmp(&group_sort_key(b)));
        out.insert(graph.identifier(node).to_string(), groups);
    }
    out
}

/// Sorts `default` before every other group name.
pub fn group_sort_key(group: &str) -> (bool, String) {
    (group != crate::project::DEFAULT_GROUP, group.to_string())
}
