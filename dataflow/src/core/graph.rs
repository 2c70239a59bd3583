//! Name-level dependency graph used for cycle detection.
//!
//! Nodes are variable (or procedure) names; an edge `a -> b` means producing
//! `b` reads `a`. Uses petgraph for the graph algorithms.

use std::collections::HashMap;

use petgraph::algo::{is_cyclic_directed, kosaraju_scc};
use petgraph::graph::{DiGraph, NodeIndex};

#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.node_map.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
        idx
    }

    /// Record that producing `to` requires `from`.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let from = self.node(from);
        let to = self.node(to);
        if !self.graph.contains_edge(from, to) {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Names on one cycle, sorted, or `None` if the graph is acyclic.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        if !self.has_cycle() {
            return None;
        }
        kosaraju_scc(&self.graph)
            .into_iter()
            .find(|component| {
                component.len() > 1
                    || self
                        .graph
                        .contains_edge(component[0], component[0])
            })
            .map(|component| {
                let mut names: Vec<String> = component
                    .into_iter()
                    .map(|idx| self.graph[idx].clone())
                    .collect();
                names.sort();
                names
            })
    }
}
