//! The Dependency Graph: directed `former`-edges over entity ids, with a
//! deterministic topological order.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};

/// A cycle detected during topological sort, carrying the cycle path for
/// the `E0342` diagnostic's `details.cycle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub cycle: Vec<String>,
}

/// Directed graph over entity ids. Storage is `petgraph::DiGraph` (matching
/// the rest of the pipeline's graph dependency), but the topological order
/// is hand-computed with an explicit in-degree map and a `BTreeSet`
/// ready-frontier rather than `petgraph::algo::toposort`, since that
/// routine does not guarantee the ascending-id-string tie-break reproducible
/// diagnostic ordering requires.
#[derive(Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    nodes: BTreeMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&mut self, id: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.nodes.insert(id.to_string(), idx);
        idx
    }

    /// Adds a directed edge `from -> to` (dependent -> dependency). Both
    /// endpoints are created if not already present, so an entity with no
    /// `former` still appears as an isolated node.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        let from_idx = self.node(from);
        let to_idx = self.node(to);
        self.graph.update_edge(from_idx, to_idx, ());
    }

    pub fn ensure_node(&mut self, id: &str) {
        self.node(id);
    }

    /// Kahn's algorithm: ready nodes (in-degree zero in the "depends on"
    /// direction modelled here, i.e. no unresolved outgoing edges) are
    /// visited in ascending string order, making the order deterministic
    /// for a fixed edge set.
    pub fn topological_sort(&self) -> Result<Vec<String>, CycleError> {
        let mut out_degree: BTreeMap<NodeIndex, usize> = BTreeMap::new();
        for idx in self.graph.node_indices() {
            out_degree.insert(idx, self.graph.neighbors(idx).count());
        }

        let mut ready: BTreeSet<String> = self
            .nodes
            .iter()
            .filter(|(_, idx)| out_degree[idx] == 0)
            .map(|(name, _)| name.clone())
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited: BTreeSet<NodeIndex> = BTreeSet::new();

        while let Some(name) = ready.iter().next().cloned() {
            ready.remove(&name);
            let idx = self.nodes[&name];
            visited.insert(idx);
            order.push(name.clone());

            // Any node with an edge into `idx` (i.e. depends on it) may now
            // be ready, once all of *its* outgoing edges point at visited
            // nodes.
            for dependent in self.graph.neighbors_directed(idx, petgraph::Direction::Incoming) {
                if visited.contains(&dependent) {
                    continue;
                }
                let all_deps_visited = self
                    .graph
                    .neighbors(dependent)
                    .all(|target| visited.contains(&target));
                if all_deps_visited {
                    ready.insert(self.graph[dependent].clone());
                }
            }
        }

        if order.len() != self.nodes.len() {
            let cycle = self.find_cycle(&visited);
            return Err(CycleError { cycle });
        }

        Ok(order)
    }

    /// Best-effort extraction of one cycle among the unvisited remainder,
    /// for the `E0342` diagnostic's `details.cycle`.
    fn find_cycle(&self, visited: &BTreeSet<NodeIndex>) -> Vec<String> {
        let remaining: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| !visited.contains(n))
            .collect();

        let Some(&start) = remaining.iter().next() else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        let mut seen: BTreeMap<NodeIndex, usize> = BTreeMap::new();
        seen.insert(start, 0);

        loop {
            let next = self
                .graph
                .neighbors(current)
                .filter(|n| remaining.contains(n))
                .min_by_key(|n| self.graph[*n].clone());
            let Some(next) = next else {
                break;
            };
            if let Some(&first_idx) = seen.get(&next) {
                let mut cycle: Vec<String> =
                    path[first_idx..].iter().map(|n| self.graph[*n].clone()).collect();
                cycle.push(self.graph[next].clone());
                return cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
        path.into_iter().map(|n| self.graph[n].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_sorts_dependency_first() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("doc-v2", "doc-v1");
        graph.add_edge("doc-v3", "doc-v2");
        let order = graph.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("doc-v1") < pos("doc-v2"));
        assert!(pos("doc-v2") < pos("doc-v3"));
    }

    #[test]
    fn ties_break_by_ascending_id_string() {
        let mut graph = DependencyGraph::new();
        graph.ensure_node("zebra");
        graph.ensure_node("apple");
        graph.ensure_node("mango");
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("A", "B");
        graph.add_edge("B", "A");
        let err = graph.topological_sort().unwrap_err();
        assert!(err.cycle.contains(&"A".to_string()));
        assert!(err.cycle.contains(&"B".to_string()));
    }

    #[test]
    fn same_inputs_yield_same_order() {
        let build = || {
            let mut graph = DependencyGraph::new();
            graph.add_edge("c", "b");
            graph.add_edge("b", "a");
            graph.ensure_node("d");
            graph
        };
        assert_eq!(build().topological_sort(), build().topological_sort());
    }
}
