//! Topological sorting of a workflow graph (Kahn's algorithm, in waves).
//!
//! The sorter never fails: it reports what it could order and what it could
//! not. Nodes left over once no zero-in-degree node remains are the
//! *unresolved* set; a non-empty unresolved set is exactly `has_cycle()`.
//!
//! Ties are broken by declaration order, so repeated calls over the same
//! input produce identical results.

use std::collections::{BTreeSet, HashMap};

use crate::models::{WorkflowEdge, WorkflowNode};
use crate::EngineError;

/// Outcome of sorting a node/edge set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyResult {
    ordered: Vec<String>,
    layers: Vec<Vec<String>>,
    unresolved: BTreeSet<String>,
}

impl TopologyResult {
    /// True if the graph cannot be fully ordered.
    pub fn has_cycle(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// Nodes left out of the order because a cycle (or a dependency on an
    /// undeclared node) prevented resolution.
    pub fn unresolved_nodes(&self) -> &BTreeSet<String> {
        &self.unresolved
    }

    /// Nodes with no incoming edges, in declaration order.
    pub fn initial_nodes(&self) -> &[String] {
        self.layers.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every resolved node in topological order.
    pub fn ordered_nodes(&self) -> &[String] {
        &self.ordered
    }

    /// Kahn waves: each layer only depends on nodes of earlier layers, so the
    /// nodes of one layer may run in parallel.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Convert a cyclic result into [`EngineError::CyclicGraph`].
    pub fn ensure_acyclic(self) -> Result<Self, EngineError> {
        if self.has_cycle() {
            return Err(EngineError::CyclicGraph {
                unresolved: self.unresolved,
            });
        }
        Ok(self)
    }
}

/// Sort `nodes` according to `edges`.
pub fn sort(nodes: &[WorkflowNode], edges: &[WorkflowEdge]) -> TopologyResult {
    // Declaration index doubles as the tie-breaker.
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, n)| (n.id.as_str(), idx))
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];

    for edge in edges {
        let Some(&to) = position.get(edge.to()) else {
            continue;
        };
        in_degree[to] += 1;
        // An edge from an undeclared node is never satisfied, so its target
        // stays unresolved.
        if let Some(&from) = position.get(edge.from()) {
            adjacency[from].push(to);
        }
    }

    let mut layer: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut ordered: Vec<String> = Vec::with_capacity(nodes.len());
    let mut resolved = vec![false; nodes.len()];

    while !layer.is_empty() {
        let mut next: Vec<usize> = Vec::new();
        for &idx in &layer {
            resolved[idx] = true;
            for &neighbour in &adjacency[idx] {
                in_degree[neighbour] -= 1;
                if in_degree[neighbour] == 0 {
                    next.push(neighbour);
                }
            }
        }

        let names: Vec<String> = layer.iter().map(|&i| nodes[i].id.clone()).collect();
        ordered.extend(names.iter().cloned());
        layers.push(names);

        next.sort_unstable();
        next.dedup();
        layer = next;
    }

    let unresolved = nodes
        .iter()
        .enumerate()
        .filter(|(idx, _)| !resolved[*idx])
        .map(|(_, n)| n.id.clone())
        .collect();

    TopologyResult {
        ordered,
        layers,
        unresolved,
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn make_nodes(ids: &[&str]) -> Vec<WorkflowNode> {
        ids.iter().map(|id| WorkflowNode::new(*id, "noop")).collect()
    }

    fn edge(from: &str, to: &str) -> WorkflowEdge {
        WorkflowEdge::new(from, to)
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn linear_graph_sorts_in_order() {
        // A → B → C
        let result = sort(
            &make_nodes(&["a", "b", "c"]),
            &[edge("a", "b"), edge("b", "c")],
        );

        assert!(!result.has_cycle());
        assert_eq!(result.ordered_nodes(), ["a", "b", "c"]);
        assert_eq!(result.initial_nodes(), ["a"]);
        assert_eq!(result.layers().len(), 3);
    }

    #[test]
    fn diamond_graph_has_parallel_middle_layer() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let result = sort(
            &make_nodes(&["a", "b", "c", "d"]),
            &[edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
        );

        assert_eq!(
            result.layers(),
            [vec!["a".to_string()], vec!["b".into(), "c".into()], vec!["d".into()]]
        );
    }

    #[test]
    fn cycle_is_reported_with_unresolved_nodes() {
        // start → A → B → C → A  (cycle!)
        let result = sort(
            &make_nodes(&["start", "a", "b", "c"]),
            &[edge("start", "a"), edge("a", "b"), edge("b", "c"), edge("c", "a")],
        );

        assert!(result.has_cycle());
        assert!(result.unresolved_nodes().is_superset(&set(&["a", "b", "c"])));
        assert_eq!(result.ordered_nodes(), ["start"]);
        assert!(matches!(
            result.ensure_acyclic(),
            Err(EngineError::CyclicGraph { unresolved }) if unresolved == set(&["a", "b", "c"])
        ));
    }

    #[test]
    fn nodes_downstream_of_a_cycle_are_unresolved() {
        let result = sort(
            &make_nodes(&["a", "b", "tail"]),
            &[edge("a", "b"), edge("b", "a"), edge("b", "tail")],
        );
        assert_eq!(result.unresolved_nodes(), &set(&["a", "b", "tail"]));
        assert!(result.initial_nodes().is_empty());
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let result = sort(&make_nodes(&["solo"]), &[edge("solo", "solo")]);
        assert!(result.has_cycle());
    }

    #[test]
    fn dependency_on_undeclared_node_is_unresolved() {
        let result = sort(&make_nodes(&["a", "b"]), &[edge("ghost", "b")]);
        assert_eq!(result.unresolved_nodes(), &set(&["b"]));
        assert_eq!(result.initial_nodes(), ["a"]);
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let result = sort(&make_nodes(&["solo"]), &[]);
        assert_eq!(result.ordered_nodes(), ["solo"]);
        assert_eq!(result.initial_nodes(), ["solo"]);
    }

    #[test]
    fn initial_nodes_keep_declaration_order() {
        let result = sort(&make_nodes(&["z", "m", "a"]), &[]);
        assert_eq!(result.initial_nodes(), ["z", "m", "a"]);
    }

    /// Pseudo-random DAGs: edges only go from lower to higher index, so the
    /// graph is acyclic by construction.
    #[test]
    fn acyclic_graphs_are_fully_ordered() {
        let mut seed: u64 = 42;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for _ in 0..25 {
            let count = 2 + next() % 30;
            let ids: Vec<String> = (0..count).map(|i| format!("n{i}")).collect();
            let nodes: Vec<WorkflowNode> = ids.iter().map(|id| WorkflowNode::new(id, "noop")).collect();

            let mut edges = Vec::new();
            for _ in 0..count * 2 {
                let from = next() % (count - 1);
                let to = from + 1 + next() % (count - from - 1);
                edges.push(edge(&ids[from], &ids[to]));
            }

            let result = sort(&nodes, &edges);
            assert!(!result.has_cycle());

            let covered: BTreeSet<String> = result.layers().iter().flatten().cloned().collect();
            assert_eq!(covered, ids.iter().cloned().collect::<BTreeSet<_>>());

            let targets: BTreeSet<&str> = edges.iter().map(|e| e.to()).collect();
            let expected_initial: Vec<String> =
                ids.iter().filter(|id| !targets.contains(id.as_str())).cloned().collect();
            assert_eq!(result.initial_nodes(), expected_initial.as_slice());

            // Every edge points forward in the order.
            let rank: HashMap<&str, usize> = result
                .ordered_nodes()
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();
            assert!(edges.iter().all(|e| rank[e.from()] < rank[e.to()]));

            assert_eq!(sort(&nodes, &edges), result, "sorting must be reproducible");
        }
    }
}
