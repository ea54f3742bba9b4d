// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Graph construction and staleness sweeps
//!
//! Nodes are attached in layers: the first frontier is every record whose
//! inputs are all external, each following frontier is every remaining
//! record whose producers have already been placed. A frontier that
//! cannot advance while records remain means the metadata describes a
//! cycle, which is refused outright.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

use crate::errors::{BioflowError, BioflowResult};
use crate::meta::OutputMeta;

/// A vertex in the dependency graph
///
/// Holds every metadata record sharing the same position in the DAG:
/// records placed in the same layer with an identical input set.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The records at this position
    pub values: Vec<OutputMeta>,
}

/// The dependency graph over one scan of the metadata store
pub struct DependencyGraph {
    pub(super) graph: DiGraph<GraphNode, ()>,
    pub(super) path_to_node: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from scanned metadata records.
    ///
    /// `metas` is expected in the store's ascending-timestamp order;
    /// insertion order preserves that sort within each layer. After
    /// construction, `max_timestamp` is propagated forwards and
    /// `up_to_date` is decided backwards, so every value carries its
    /// computed state.
    pub fn build(metas: Vec<OutputMeta>) -> BioflowResult<Self> {
        let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
        let mut path_to_node: HashMap<String, NodeIndex> = HashMap::new();
        let mut remaining = metas;

        while !remaining.is_empty() {
            let remaining_paths: HashSet<String> = remaining
                .iter()
                .map(|m| m.output_path.clone())
                .collect();

            // Ready: no input is produced by a record still waiting to be placed
            let (ready, rest): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|m| m.inputs.iter().all(|i| !remaining_paths.contains(i)));

            if ready.is_empty() {
                let outputs = rest.into_iter().map(|m| m.output_path).collect();
                return Err(BioflowError::CircularDependency { outputs });
            }

            // Group the layer by identical ordered input set; each group
            // becomes one node, order within the layer preserved
            let mut groups: Vec<(Vec<String>, Vec<OutputMeta>)> = Vec::new();
            for meta in ready {
                match groups.iter_mut().find(|(key, _)| *key == meta.inputs) {
                    Some((_, values)) => values.push(meta),
                    None => groups.push((meta.inputs.clone(), vec![meta])),
                }
            }

            for (inputs, values) in groups {
                let paths: Vec<String> =
                    values.iter().map(|v| v.output_path.clone()).collect();
                let node = graph.add_node(GraphNode { values });

                for input in &inputs {
                    if let Some(&parent) = path_to_node.get(input) {
                        if !graph.contains_edge(parent, node) {
                            graph.add_edge(parent, node, ());
                        }
                    }
                }

                for path in paths {
                    path_to_node.insert(path, node);
                }
            }

            remaining = rest;
        }

        let mut dep = Self {
            graph,
            path_to_node,
        };
        dep.propagate_timestamps()?;
        dep.mark_up_to_date()?;
        Ok(dep)
    }

    /// Forward sweep: each value's `max_timestamp` is the maximum of its
    /// own timestamp and the `max_timestamp` of every parent value that
    /// produced one of its inputs. Roots keep their own timestamp.
    fn propagate_timestamps(&mut self) -> BioflowResult<()> {
        let order = toposort(&self.graph, None).map_err(|_| self.cycle_error())?;

        for node in order {
            let parent_stamps: Vec<(String, i64)> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .flat_map(|p| {
                    self.graph[p]
                        .values
                        .iter()
                        .map(|q| (q.output_path.clone(), q.max_timestamp))
                        .collect::<Vec<_>>()
                })
                .collect();

            for value in &mut self.graph[node].values {
                let mut max = value.timestamp;
                for (path, stamp) in &parent_stamps {
                    if value.inputs.contains(path) && *stamp > max {
                        max = *stamp;
                    }
                }
                value.max_timestamp = max;
            }
        }

        Ok(())
    }

    /// Backward sweep deciding `up_to_date`, children first:
    ///
    /// 1. a producing parent with `max_timestamp >= timestamp` makes the
    ///    value stale (equal timestamps after a cleaned rebuild must
    ///    force recomputation, hence `>=`)
    /// 2. otherwise a file present on disk is up to date
    /// 3. otherwise a file missing without `cleaned` is stale
    /// 4. otherwise a cleaned file is up to date iff every child value
    ///    is; a cleaned leaf is stale
    fn mark_up_to_date(&mut self) -> BioflowResult<()> {
        let mut order = toposort(&self.graph, None).map_err(|_| self.cycle_error())?;
        order.reverse();

        for node in order {
            let parent_stamps: Vec<(String, i64)> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .flat_map(|p| {
                    self.graph[p]
                        .values
                        .iter()
                        .map(|q| (q.output_path.clone(), q.max_timestamp))
                        .collect::<Vec<_>>()
                })
                .collect();

            let child_flags: Vec<Option<bool>> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .flat_map(|c| {
                    self.graph[c]
                        .values
                        .iter()
                        .map(|v| v.up_to_date)
                        .collect::<Vec<_>>()
                })
                .collect();
            let has_children = !child_flags.is_empty();

            for value in &mut self.graph[node].values {
                let newer_parent = parent_stamps
                    .iter()
                    .any(|(path, stamp)| value.inputs.contains(path) && *stamp >= value.timestamp);

                let up_to_date = if newer_parent {
                    false
                } else if value.output_file.exists() {
                    true
                } else if !value.cleaned {
                    false
                } else if !has_children {
                    false
                } else {
                    child_flags.iter().all(|f| *f == Some(true))
                };

                value.up_to_date = Some(up_to_date);
            }
        }

        Ok(())
    }

    fn cycle_error(&self) -> BioflowError {
        BioflowError::CircularDependency {
            outputs: self.path_to_node.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build::test_support::meta;

    #[test]
    fn test_linear_chain_layering() {
        // in.txt (external) -> a.txt -> b.txt
        let graph = DependencyGraph::build(vec![
            meta("a.txt", &["in.txt"], 100),
            meta("b.txt", &["a.txt"], 200),
        ])
        .unwrap();

        let a = graph.path_to_node["a.txt"];
        let b = graph.path_to_node["b.txt"];

        let children: Vec<_> = graph
            .graph
            .neighbors_directed(a, Direction::Outgoing)
            .collect();
        assert_eq!(children, vec![b]);

        let parents: Vec<_> = graph
            .graph
            .neighbors_directed(b, Direction::Incoming)
            .collect();
        assert_eq!(parents, vec![a]);
    }

    #[test]
    fn test_layering_soundness() {
        // Every input of every value is either external or some parent's output
        let graph = DependencyGraph::build(vec![
            meta("a.txt", &["raw1.fq", "raw2.fq"], 100),
            meta("b.txt", &["raw1.fq"], 110),
            meta("c.txt", &["a.txt", "b.txt"], 200),
        ])
        .unwrap();

        for node in graph.graph.node_indices() {
            let parent_paths: HashSet<String> = graph
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .flat_map(|p| graph.graph[p].values.iter().map(|v| v.output_path.clone()))
                .collect();

            for value in &graph.graph[node].values {
                for input in &value.inputs {
                    let internal = graph.path_to_node.contains_key(input);
                    assert!(
                        !internal || parent_paths.contains(input),
                        "input {input} of {} not reachable from a parent",
                        value.output_path
                    );
                }
            }
        }
    }

    #[test]
    fn test_cycle_is_fatal() {
        let result = DependencyGraph::build(vec![
            meta("a.txt", &["b.txt"], 100),
            meta("b.txt", &["a.txt"], 200),
        ]);
        assert!(matches!(
            result,
            Err(BioflowError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_same_inputs_share_a_node() {
        let graph = DependencyGraph::build(vec![
            meta("left.txt", &["in.txt"], 100),
            meta("right.txt", &["in.txt"], 100),
            meta("merged.txt", &["left.txt", "right.txt"], 200),
        ])
        .unwrap();

        assert_eq!(
            graph.path_to_node["left.txt"],
            graph.path_to_node["right.txt"]
        );
        assert_ne!(
            graph.path_to_node["left.txt"],
            graph.path_to_node["merged.txt"]
        );
    }

    #[test]
    fn test_timestamp_propagation() {
        let graph = DependencyGraph::build(vec![
            meta("a.txt", &["in.txt"], 500),
            meta("b.txt", &["a.txt"], 200),
            meta("c.txt", &["b.txt"], 900),
        ])
        .unwrap();

        // b inherits a's larger stamp; c keeps its own
        assert_eq!(graph.meta_for("a.txt").unwrap().max_timestamp, 500);
        assert_eq!(graph.meta_for("b.txt").unwrap().max_timestamp, 500);
        assert_eq!(graph.meta_for("c.txt").unwrap().max_timestamp, 900);
    }

    #[test]
    fn test_max_timestamp_monotonicity() {
        let graph = DependencyGraph::build(vec![
            meta("a.txt", &["x.fq"], 300),
            meta("b.txt", &["a.txt", "y.fq"], 100),
            meta("c.txt", &["b.txt"], 50),
        ])
        .unwrap();

        for node in graph.graph.node_indices() {
            for value in &graph.graph[node].values {
                assert!(value.max_timestamp >= value.timestamp);
                for parent in graph.graph.neighbors_directed(node, Direction::Incoming) {
                    for q in &graph.graph[parent].values {
                        if value.inputs.contains(&q.output_path) {
                            assert!(value.max_timestamp >= q.max_timestamp);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_newer_parent_marks_stale() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("b.txt");
        std::fs::write(&out, "data").unwrap();

        let mut parent = meta("a.txt", &["in.txt"], 900);
        parent.output_file = dir.path().join("a.txt");
        std::fs::write(&parent.output_file, "data").unwrap();

        let mut child = meta("b.txt", &["a.txt"], 500);
        child.output_file = out;

        let graph = DependencyGraph::build(vec![child, parent]).unwrap();
        // a was rebuilt after b: b is stale even though it exists
        assert_eq!(graph.meta_for("b.txt").unwrap().up_to_date, Some(false));
    }

    #[test]
    fn test_missing_not_cleaned_is_stale() {
        let graph =
            DependencyGraph::build(vec![meta("gone.txt", &["in.txt"], 100)]).unwrap();
        assert_eq!(graph.meta_for("gone.txt").unwrap().up_to_date, Some(false));
    }

    #[test]
    fn test_cleaned_leaf_is_stale() {
        let mut m = meta("inter.txt", &["in.txt"], 100);
        m.cleaned = true;

        let graph = DependencyGraph::build(vec![m]).unwrap();
        assert_eq!(graph.meta_for("inter.txt").unwrap().up_to_date, Some(false));
    }

    #[test]
    fn test_cleaned_with_current_children_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();

        let mut cleaned = meta("inter.txt", &["in.txt"], 100);
        cleaned.cleaned = true;

        let mut leaf = meta("final.txt", &["inter.txt"], 200);
        leaf.output_file = dir.path().join("final.txt");
        std::fs::write(&leaf.output_file, "data").unwrap();

        let graph = DependencyGraph::build(vec![cleaned, leaf]).unwrap();
        assert_eq!(graph.meta_for("final.txt").unwrap().up_to_date, Some(true));
        assert_eq!(graph.meta_for("inter.txt").unwrap().up_to_date, Some(true));
    }

    #[test]
    fn test_cleaned_with_stale_children_is_stale() {
        let mut cleaned = meta("inter.txt", &["in.txt"], 100);
        cleaned.cleaned = true;

        // Child missing and not cleaned: stale, which poisons the cleaned parent
        let leaf = meta("final.txt", &["inter.txt"], 200);

        let graph = DependencyGraph::build(vec![cleaned, leaf]).unwrap();
        assert_eq!(graph.meta_for("final.txt").unwrap().up_to_date, Some(false));
        assert_eq!(graph.meta_for("inter.txt").unwrap().up_to_date, Some(false));
    }
}
