// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Staleness queries and graph views

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use super::{DependencyGraph, GraphNode};
use crate::meta::OutputMeta;
use crate::utils::mtime_millis;

impl DependencyGraph {
    /// Number of nodes in the graph
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph holds no outputs at all
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// The node holding the record for an output path
    pub fn entry_for(&self, path: &str) -> Option<&GraphNode> {
        self.path_to_node.get(path).map(|&idx| &self.graph[idx])
    }

    /// The record for an output path
    pub fn meta_for(&self, path: &str) -> Option<&OutputMeta> {
        self.entry_for(path)?
            .values
            .iter()
            .find(|v| v.output_path == path)
    }

    /// Computed staleness for an output path, if the graph knows it
    pub fn up_to_date(&self, path: &str) -> Option<bool> {
        self.meta_for(path)?.up_to_date
    }

    /// Nodes with no children, in depth-first order from the roots.
    /// These are the final outputs of the recorded runs.
    pub fn leaves(&self) -> Vec<&GraphNode> {
        let mut leaves = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<NodeIndex> = self.root_indices();
        stack.reverse();

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }

            let children: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();

            if children.is_empty() {
                leaves.push(&self.graph[node]);
            } else {
                for child in children.into_iter().rev() {
                    stack.push(child);
                }
            }
        }

        leaves
    }

    /// A reduced graph containing only the ancestors and descendants of
    /// the node for `path`, for focused display. Parents outside the
    /// lineage are dropped, so each kept parent points only at the
    /// relevant children.
    pub fn filter(&self, path: &str) -> Option<DependencyGraph> {
        let focus = *self.path_to_node.get(path)?;

        let mut keep: HashSet<NodeIndex> = HashSet::new();
        keep.insert(focus);
        self.collect_reachable(focus, Direction::Incoming, &mut keep);
        self.collect_reachable(focus, Direction::Outgoing, &mut keep);

        let mut graph: DiGraph<GraphNode, ()> = DiGraph::new();
        let mut path_to_node = HashMap::new();
        let mut remap: HashMap<NodeIndex, NodeIndex> = HashMap::new();

        // Preserve original insertion order
        for node in self.graph.node_indices() {
            if !keep.contains(&node) {
                continue;
            }
            let new_node = graph.add_node(self.graph[node].clone());
            remap.insert(node, new_node);
            for value in &graph[new_node].values {
                path_to_node.insert(value.output_path.clone(), new_node);
            }
        }

        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                if let (Some(&nf), Some(&nt)) = (remap.get(&from), remap.get(&to)) {
                    graph.add_edge(nf, nt, ());
                }
            }
        }

        Some(DependencyGraph {
            graph,
            path_to_node,
        })
    }

    /// Decide whether `outputs` need rebuilding given `inputs`.
    ///
    /// Paths are resolved against `base` for filesystem checks but
    /// looked up in the graph as given. No outputs: trivially up to
    /// date. No inputs: up to date iff every output exists. Otherwise
    /// an output no older than every input is current; an older output
    /// that still exists forces a rebuild; an older output that is gone
    /// is acceptable only when the graph has no record of it, or
    /// records it as cleaned and up to date.
    pub fn check_up_to_date(&self, outputs: &[String], inputs: &[String], base: &Path) -> bool {
        if outputs.is_empty() {
            return true;
        }

        if inputs.is_empty() {
            return outputs.iter().all(|o| base.join(o).exists());
        }

        let older: Vec<&String> = outputs
            .iter()
            .filter(|o| {
                let out_ts = mtime_millis(&base.join(o.as_str())).unwrap_or(0);
                inputs
                    .iter()
                    .any(|i| mtime_millis(&base.join(i.as_str())).unwrap_or(0) >= out_ts)
            })
            .collect();

        if older.iter().any(|o| base.join(o.as_str()).exists()) {
            return false;
        }

        older.iter().all(|o| match self.meta_for(o) {
            None => true,
            Some(m) => m.cleaned && m.up_to_date == Some(true),
        })
    }

    /// Render the graph in DOT format
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph outputs {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                for fv in &self.graph[from].values {
                    for tv in &self.graph[to].values {
                        if tv.inputs.contains(&fv.output_path) {
                            out.push_str(&format!(
                                "    \"{}\" -> \"{}\";\n",
                                fv.output_path, tv.output_path
                            ));
                        }
                    }
                }
            }
        }

        for node in self.graph.node_indices() {
            if self.graph.neighbors_undirected(node).count() == 0 {
                for value in &self.graph[node].values {
                    out.push_str(&format!("    \"{}\";\n", value.output_path));
                }
            }
        }

        out.push_str("}\n");
        out
    }

    /// Render a per-output status report
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        for node in self.breadth_first_indices() {
            for value in &self.graph[node].values {
                let state = match value.up_to_date {
                    Some(true) => "up-to-date",
                    Some(false) => "stale",
                    None => "unknown",
                };
                let mut flags = Vec::new();
                if value.cleaned {
                    flags.push("cleaned");
                }
                if value.preserve {
                    flags.push("preserved");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                out.push_str(&format!("{:<12} {}{}\n", state, value.output_path, flags));
            }
        }

        out
    }

    fn root_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    fn breadth_first_indices(&self) -> Vec<NodeIndex> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self.root_indices().into();

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            order.push(node);
            for child in self.graph.neighbors_directed(node, Direction::Outgoing) {
                queue.push_back(child);
            }
        }

        order
    }

    fn collect_reachable(
        &self,
        from: NodeIndex,
        direction: Direction,
        seen: &mut HashSet<NodeIndex>,
    ) {
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, direction) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
}
