//! Dependency graph over a normalized workflow.
//!
//! Wraps a [`petgraph`] directed graph to answer the questions the
//! validator, scheduler and replay machinery ask: predecessors/successors,
//! entry and exit nodes, level schedules, reachability, and cycle detection
//! that exempts loop-mediated back-edges.

use std::collections::{HashMap, HashSet, VecDeque};

use aster_core::{NodeId, PortSemantics};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::document::Workflow;
use crate::error::WorkflowError;
use crate::step::StepDef;

/// Modules whose outgoing edges may legitimately close a cycle.
const CYCLE_MEDIATORS: &[&str] = &["flow.loop", "flow.foreach", "flow.goto"];

/// A directed dependency graph built from a workflow's nodes and edges.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, usize>,
    indices: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph; fails if an edge references an unknown node.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in workflow.nodes() {
            let idx = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), idx);
        }

        for (edge_index, edge) in workflow.edges().iter().enumerate() {
            let source = indices
                .get(&edge.source_node)
                .ok_or_else(|| WorkflowError::UnknownNode(edge.source_node.to_string()))?;
            let target = indices
                .get(&edge.target_node)
                .ok_or_else(|| WorkflowError::UnknownNode(edge.target_node.to_string()))?;
            graph.add_edge(*source, *target, edge_index);
        }

        Ok(Self { graph, indices })
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Whether the graph contains the given node.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.indices.contains_key(node)
    }

    /// Direct predecessors of a node, in edge-declaration order.
    #[must_use]
    pub fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Direct successors of a node, in edge-declaration order.
    #[must_use]
    pub fn successors(&self, node: &NodeId) -> Vec<NodeId> {
        self.neighbors(node, Direction::Outgoing)
    }

    fn neighbors(&self, node: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&idx) = self.indices.get(node) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, direction)
            .map(|e| {
                let other = match direction {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                (*e.weight(), self.graph[other].clone())
            })
            .collect();
        edges.sort_by_key(|(weight, _)| *weight);
        let mut seen = HashSet::new();
        edges
            .into_iter()
            .filter_map(|(_, id)| seen.insert(id.clone()).then_some(id))
            .collect()
    }

    /// Nodes with no incoming edges, in node-declaration order.
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.boundary_nodes(Direction::Incoming)
    }

    /// Nodes with no outgoing edges, in node-declaration order.
    #[must_use]
    pub fn exit_nodes(&self) -> Vec<NodeId> {
        self.boundary_nodes(Direction::Outgoing)
    }

    fn boundary_nodes(&self, direction: Direction) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, direction).next().is_none())
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// All nodes reachable from `start` by following outgoing edges.
    ///
    /// `start` itself is not included unless it lies on a cycle.
    #[must_use]
    pub fn downstream_of(&self, start: &NodeId) -> HashSet<NodeId> {
        self.reach(start, Direction::Outgoing)
    }

    /// All nodes from which `target` is reachable.
    #[must_use]
    pub fn ancestors_of(&self, target: &NodeId) -> HashSet<NodeId> {
        self.reach(target, Direction::Incoming)
    }

    fn reach(&self, origin: &NodeId, direction: Direction) -> HashSet<NodeId> {
        let mut found = HashSet::new();
        let Some(&start) = self.indices.get(origin) else {
            return found;
        };
        let mut queue = VecDeque::from([start]);
        let mut visited = HashSet::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if visited.insert(next) {
                    found.insert(self.graph[next].clone());
                    queue.push_back(next);
                }
            }
        }
        found
    }

    /// Nodes unreachable from any entry node.
    ///
    /// If the graph has no entry node at all (everything lies on cycles),
    /// every node is reported.
    #[must_use]
    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        let mut reachable: HashSet<NodeId> = HashSet::new();
        for entry in self.entry_nodes() {
            reachable.insert(entry.clone());
            reachable.extend(self.downstream_of(&entry));
        }
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .filter(|id| !reachable.contains(id))
            .collect()
    }

    /// Find a cycle not mediated by a loop construct.
    ///
    /// Edges are exempt when their source node's module is `flow.loop`,
    /// `flow.foreach` or `flow.goto` (those carry an iteration ceiling at
    /// runtime), or when the edge is tagged with `iterate` semantics.
    /// Returns the offending cycle as a node path, if any.
    #[must_use]
    pub fn find_unmediated_cycle(&self, workflow: &Workflow) -> Option<Vec<NodeId>> {
        let exempt: HashSet<usize> = workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, edge)| {
                matches!(edge.semantics, Some(PortSemantics::Iterate))
                    || workflow
                        .node(&edge.source_node)
                        .is_some_and(is_cycle_mediator)
            })
            .map(|(i, _)| i)
            .collect();

        // Iterative DFS with colors over the non-exempt edge view.
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut colors = vec![Color::White; self.graph.node_count()];
        let mut parent: Vec<Option<NodeIndex>> = vec![None; self.graph.node_count()];

        for root in self.graph.node_indices() {
            if colors[root.index()] != Color::White {
                continue;
            }
            let mut stack = vec![(root, false)];
            while let Some((idx, processed)) = stack.pop() {
                if processed {
                    colors[idx.index()] = Color::Black;
                    continue;
                }
                if colors[idx.index()] == Color::Black {
                    continue;
                }
                colors[idx.index()] = Color::Grey;
                stack.push((idx, true));
                for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                    if exempt.contains(edge.weight()) {
                        continue;
                    }
                    let next = edge.target();
                    match colors[next.index()] {
                        Color::White => {
                            parent[next.index()] = Some(idx);
                            stack.push((next, false));
                        }
                        Color::Grey => {
                            // Found a back edge: reconstruct idx → ... → next.
                            let mut path = vec![self.graph[next].clone()];
                            let mut cursor = idx;
                            while cursor != next {
                                path.push(self.graph[cursor].clone());
                                match parent[cursor.index()] {
                                    Some(p) => cursor = p,
                                    None => break,
                                }
                            }
                            path.reverse();
                            return Some(path);
                        }
                        Color::Black => {}
                    }
                }
            }
        }
        None
    }

    /// Compute a level schedule (Kahn's algorithm) over the mediated view.
    ///
    /// Each level's nodes have all their (non-exempt) predecessors in
    /// earlier levels. Fails if an unmediated cycle remains.
    pub fn compute_levels(&self, workflow: &Workflow) -> Result<Vec<Vec<NodeId>>, WorkflowError> {
        if let Some(cycle) = self.find_unmediated_cycle(workflow) {
            let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(WorkflowError::Shape(format!(
                "cycle detected: {}",
                path.join(" -> ")
            )));
        }

        let exempt: HashSet<usize> = workflow
            .edges()
            .iter()
            .enumerate()
            .filter(|(_, edge)| {
                matches!(edge.semantics, Some(PortSemantics::Iterate))
                    || workflow
                        .node(&edge.source_node)
                        .is_some_and(is_cycle_mediator)
            })
            .map(|(i, _)| i)
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self
                    .graph
                    .edges_directed(idx, Direction::Incoming)
                    .filter(|e| !exempt.contains(e.weight()))
                    .count();
                (idx, degree)
            })
            .collect();

        let mut current: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx] == 0)
            .collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            levels.push(current.iter().map(|&idx| self.graph[idx].clone()).collect());
            let mut next = Vec::new();
            for &idx in &current {
                for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                    if exempt.contains(edge.weight()) {
                        continue;
                    }
                    let entry = in_degree.get_mut(&edge.target()).expect("known node");
                    *entry -= 1;
                    if *entry == 0 {
                        next.push(edge.target());
                    }
                }
            }
            current = next;
        }

        Ok(levels)
    }
}

fn is_cycle_mediator(step: &StepDef) -> bool {
    CYCLE_MEDIATORS.contains(&step.module.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeDef;
    use aster_core::ModuleId;
    use pretty_assertions::assert_eq;

    fn nid(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    fn step(id: &str, module: &str) -> StepDef {
        StepDef::new(nid(id), ModuleId::new(module).unwrap())
    }

    fn diamond() -> Workflow {
        Workflow::new("diamond")
            .with_node(step("a", "string.trim"))
            .with_node(step("b", "string.trim"))
            .with_node(step("c", "string.trim"))
            .with_node(step("d", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("b")))
            .with_edge(EdgeDef::new(nid("a"), nid("c")))
            .with_edge(EdgeDef::new(nid("b"), nid("d")))
            .with_edge(EdgeDef::new(nid("c"), nid("d")))
    }

    #[test]
    fn build_and_count() {
        let wf = diamond();
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        assert_eq!(graph.node_count(), 4);
        assert!(graph.contains(&nid("a")));
        assert!(!graph.contains(&nid("z")));
    }

    #[test]
    fn unknown_edge_target_fails() {
        let wf = Workflow::new("bad")
            .with_node(step("a", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("ghost")));
        assert_eq!(
            DependencyGraph::from_workflow(&wf).unwrap_err(),
            WorkflowError::UnknownNode("ghost".into())
        );
    }

    #[test]
    fn predecessors_and_successors() {
        let wf = diamond();
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        assert_eq!(graph.successors(&nid("a")), vec![nid("b"), nid("c")]);
        assert_eq!(graph.predecessors(&nid("d")), vec![nid("b"), nid("c")]);
        assert!(graph.predecessors(&nid("a")).is_empty());
    }

    #[test]
    fn entry_and_exit_nodes() {
        let wf = diamond();
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        assert_eq!(graph.entry_nodes(), vec![nid("a")]);
        assert_eq!(graph.exit_nodes(), vec![nid("d")]);
    }

    #[test]
    fn downstream_and_ancestors() {
        let wf = diamond();
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        let downstream = graph.downstream_of(&nid("b"));
        assert_eq!(downstream, HashSet::from([nid("d")]));
        let ancestors = graph.ancestors_of(&nid("d"));
        assert_eq!(ancestors, HashSet::from([nid("a"), nid("b"), nid("c")]));
    }

    #[test]
    fn unreachable_nodes_detected() {
        let wf = diamond().with_node(step("island", "string.trim"));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        // `island` has no incoming edges, so it is an entry itself — not
        // unreachable. A true orphan needs a cycle island.
        assert!(graph.unreachable_nodes().is_empty());

        let wf = diamond()
            .with_node(step("x", "string.trim"))
            .with_node(step("y", "string.trim"))
            .with_edge(EdgeDef::new(nid("x"), nid("y")))
            .with_edge(EdgeDef::new(nid("y"), nid("x")));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        let mut orphans = graph.unreachable_nodes();
        orphans.sort();
        assert_eq!(orphans, vec![nid("x"), nid("y")]);
    }

    #[test]
    fn plain_cycle_is_found() {
        let wf = Workflow::new("cyclic")
            .with_node(step("a", "string.trim"))
            .with_node(step("b", "string.trim"))
            .with_node(step("c", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("b")))
            .with_edge(EdgeDef::new(nid("b"), nid("c")))
            .with_edge(EdgeDef::new(nid("c"), nid("a")));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        let cycle = graph.find_unmediated_cycle(&wf).unwrap();
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn loop_mediated_cycle_is_exempt() {
        let wf = Workflow::new("looped")
            .with_node(step("loop", "flow.loop"))
            .with_node(step("body", "string.trim"))
            .with_edge(
                EdgeDef::new(nid("loop"), nid("body"))
                    .with_semantics(PortSemantics::Iterate),
            )
            .with_edge(EdgeDef::new(nid("body"), nid("loop")));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        assert!(graph.find_unmediated_cycle(&wf).is_none());
    }

    #[test]
    fn goto_back_edge_is_exempt() {
        let wf = Workflow::new("goto")
            .with_node(step("a", "string.trim"))
            .with_node(step("jump", "flow.goto"))
            .with_edge(EdgeDef::new(nid("a"), nid("jump")))
            .with_edge(EdgeDef::new(nid("jump"), nid("a")));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        assert!(graph.find_unmediated_cycle(&wf).is_none());
    }

    #[test]
    fn levels_linear() {
        let wf = Workflow::new("linear")
            .with_node(step("a", "string.trim"))
            .with_node(step("b", "string.trim"))
            .with_node(step("c", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("b")))
            .with_edge(EdgeDef::new(nid("b"), nid("c")));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        let levels = graph.compute_levels(&wf).unwrap();
        assert_eq!(levels, vec![vec![nid("a")], vec![nid("b")], vec![nid("c")]]);
    }

    #[test]
    fn levels_diamond() {
        let wf = diamond();
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        let levels = graph.compute_levels(&wf).unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[1].len(), 2);
    }

    #[test]
    fn levels_reject_cycle() {
        let wf = Workflow::new("cyclic")
            .with_node(step("a", "string.trim"))
            .with_node(step("b", "string.trim"))
            .with_edge(EdgeDef::new(nid("a"), nid("b")))
            .with_edge(EdgeDef::new(nid("b"), nid("a")));
        let graph = DependencyGraph::from_workflow(&wf).unwrap();
        assert!(graph.compute_levels(&wf).is_err());
    }
}
