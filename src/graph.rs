//! The task graph.
//!
//! Nodes live in a [`petgraph::Graph`], edges point from a dependency to its
//! dependent. Topology is fixed once the graph is handed to the engine; the
//! per-run node state lives in a separate [`States`] table owned by the
//! executing run.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::TaskId;
use crate::error::GraphError;
use crate::task::{TaskNode, TaskState};

/// State of every node taking part in a run, ordered by declaration.
pub type States = BTreeMap<NodeIndex, TaskState>;

/// Nodes which can make progress, as computed by [`TaskGraph::ready_set`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadySet {
    /// Pending nodes whose dependencies all resolved without failure.
    pub ready: Vec<NodeIndex>,
    /// Pending nodes with at least one failing dependency.
    pub blocked: Vec<NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Inactive,
    Active,
    Visited,
}

#[derive(Default)]
pub struct TaskGraph {
    pub(crate) graph: Graph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn add_node(&mut self, node: TaskNode) -> Result<NodeIndex, GraphError> {
        if self.index.contains_key(node.id()) {
            return Err(GraphError::DuplicateNode(node.id().clone()));
        }

        let id = node.id().clone();
        let index = self.graph.add_node(node);
        self.index.insert(id, index);

        Ok(index)
    }

    /// Declares that `dependent` needs `dependency` to finish first. Adding
    /// the same edge twice is a no-op.
    pub fn add_edge(&mut self, dependency: &str, dependent: &str) -> Result<(), GraphError> {
        let from = self.lookup(dependency)?;
        let to = self.lookup(dependent)?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.into()))
    }

    pub fn node(&self, index: NodeIndex) -> &TaskNode {
        &self.graph[index]
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.index.get(id).map(|&index| &self.graph[index])
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.graph.node_indices().map(|i| self.graph[i].id())
    }

    /// Direct dependencies of a node, in declaration order.
    pub fn dependencies(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(index, Direction::Incoming)
    }

    /// Direct dependents of a node, in declaration order.
    pub fn dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(index, Direction::Outgoing)
    }

    fn neighbors(&self, index: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<_> = self.graph.neighbors_directed(index, direction).collect();
        neighbors.sort();
        neighbors
    }

    fn roots(&self, targets: &[&str]) -> Result<Vec<NodeIndex>, GraphError> {
        if targets.is_empty() {
            return Ok(self.graph.node_indices().collect());
        }

        targets.iter().map(|target| self.lookup(target)).collect()
    }

    /// Requested targets plus everything they transitively depend on. An
    /// empty target list selects the whole graph.
    pub fn closure(&self, targets: &[&str]) -> Result<BTreeSet<NodeIndex>, GraphError> {
        let mut selected = BTreeSet::new();
        let mut stack = self.roots(targets)?;

        while let Some(index) = stack.pop() {
            if selected.insert(index) {
                stack.extend(self.graph.neighbors_directed(index, Direction::Incoming));
            }
        }

        Ok(selected)
    }

    /// Checks that no cycle is reachable from the requested targets.
    ///
    /// Depth-first search over dependency edges with an on-stack marker. The
    /// first back edge found is reported with the full path, the revisited
    /// node appearing at both ends.
    pub fn validate(&self, targets: &[&str]) -> Result<(), GraphError> {
        let mut marks = vec![Mark::Inactive; self.graph.node_count()];
        let mut path = Vec::new();

        for root in self.roots(targets)? {
            if marks[root.index()] == Mark::Inactive {
                self.visit(root, &mut marks, &mut path)?;
            }
        }

        Ok(())
    }

    fn visit(
        &self,
        index: NodeIndex,
        marks: &mut [Mark],
        path: &mut Vec<NodeIndex>,
    ) -> Result<(), GraphError> {
        marks[index.index()] = Mark::Active;
        path.push(index);

        for dependency in self.dependencies(index) {
            match marks[dependency.index()] {
                Mark::Active => {
                    let start = path
                        .iter()
                        .position(|&i| i == dependency)
                        .unwrap_or_default();

                    let cycle = path[start..]
                        .iter()
                        .chain(std::iter::once(&dependency))
                        .map(|&i| self.graph[i].id().clone())
                        .collect();

                    return Err(GraphError::Cycle(cycle));
                }
                Mark::Inactive => self.visit(dependency, marks, path)?,
                Mark::Visited => {}
            }
        }

        path.pop();
        marks[index.index()] = Mark::Visited;

        Ok(())
    }

    /// Splits the pending nodes of `states` into the ones that may start and
    /// the ones that can never start because a dependency failed.
    pub fn ready_set(&self, states: &States) -> ReadySet {
        let mut set = ReadySet::default();

        for (&index, &state) in states {
            if state != TaskState::Pending {
                continue;
            }

            let mut ready = true;
            let mut blocked = false;

            for dependency in self.graph.neighbors_directed(index, Direction::Incoming) {
                match states.get(&dependency) {
                    Some(state) if state.is_failing() => blocked = true,
                    Some(state) if state.is_resolved() => {}
                    _ => ready = false,
                }
            }

            if blocked {
                set.blocked.push(index);
            } else if ready {
                set.ready.push(index);
            }
        }

        set
    }

    /// Deterministic topological order of the whole graph, dependencies
    /// first, ties broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<TaskId>, GraphError> {
        self.validate(&[])?;

        let mut states: States = self
            .graph
            .node_indices()
            .map(|i| (i, TaskState::Pending))
            .collect();

        let mut order = Vec::with_capacity(self.len());

        loop {
            let ReadySet { ready, .. } = self.ready_set(&states);
            if ready.is_empty() {
                break;
            }
            for index in ready {
                states.insert(index, TaskState::Succeeded);
                order.push(self.graph[index].id().clone());
            }
        }

        Ok(order)
    }
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].id().as_str().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> TaskNode {
        TaskNode::new(id, || Ok(()))
    }

    fn chain(ids: &[&str]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for id in ids {
            graph.add_node(node(id)).unwrap();
        }
        for pair in ids.windows(2) {
            graph.add_edge(pair[0], pair[1]).unwrap();
        }
        graph
    }

    fn ids(graph: &TaskGraph, indices: &[NodeIndex]) -> Vec<String> {
        indices
            .iter()
            .map(|&i| graph.node(i).id().to_string())
            .collect()
    }

    #[test]
    fn test_duplicate_node() {
        let mut graph = TaskGraph::new();
        graph.add_node(node("a")).unwrap();
        assert_eq!(
            graph.add_node(node("a")),
            Err(GraphError::DuplicateNode("a".into()))
        );
    }

    #[test]
    fn test_unknown_node_edge() {
        let mut graph = chain(&["a"]);
        assert_eq!(
            graph.add_edge("a", "b"),
            Err(GraphError::UnknownNode("b".into()))
        );
        assert_eq!(
            graph.add_edge("x", "a"),
            Err(GraphError::UnknownNode("x".into()))
        );
    }

    #[test]
    fn test_no_cycle() {
        let graph = chain(&["c", "b", "a"]);
        assert!(graph.validate(&[]).is_ok());

        let order = graph.topological_order().unwrap();
        let order: Vec<_> = order.iter().map(TaskId::as_str).collect();
        assert_eq!(order, ["c", "b", "a"]);
    }

    #[test]
    fn test_cycle_path() {
        let mut graph = chain(&["a", "b", "c"]);
        graph.add_edge("c", "a").unwrap();

        let Err(GraphError::Cycle(cycle)) = graph.validate(&[]) else {
            panic!("expected a cycle");
        };

        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        for id in ["a", "b", "c"] {
            assert!(cycle.iter().any(|c| c.as_str() == id));
        }
    }

    #[test]
    fn test_self_dependency() {
        let mut graph = chain(&["a"]);
        graph.add_edge("a", "a").unwrap();

        assert_eq!(
            graph.validate(&[]),
            Err(GraphError::Cycle(vec!["a".into(), "a".into()]))
        );
    }

    #[test]
    fn test_unreachable_cycle_is_ignored_for_targets() {
        let mut graph = chain(&["a", "b"]);
        graph.add_node(node("x")).unwrap();
        graph.add_node(node("y")).unwrap();
        graph.add_edge("x", "y").unwrap();
        graph.add_edge("y", "x").unwrap();

        assert!(graph.validate(&["b"]).is_ok());
        assert!(graph.validate(&["y"]).is_err());
        assert!(graph.validate(&[]).is_err());
    }

    #[test]
    fn test_closure() {
        let mut graph = chain(&["a", "b", "c"]);
        graph.add_node(node("other")).unwrap();

        let selected: Vec<_> = graph.closure(&["b"]).unwrap().into_iter().collect();
        assert_eq!(ids(&graph, &selected), ["a", "b"]);

        assert_eq!(graph.closure(&[]).unwrap().len(), 4);
        assert_eq!(
            graph.closure(&["nope"]),
            Err(GraphError::UnknownNode("nope".into()))
        );
    }

    #[test]
    fn test_ready_set() {
        let mut graph = chain(&["a", "b", "c"]);
        graph.add_node(node("d")).unwrap();
        graph.add_edge("a", "d").unwrap();

        let a = graph.lookup("a").unwrap();
        let b = graph.lookup("b").unwrap();
        let c = graph.lookup("c").unwrap();
        let d = graph.lookup("d").unwrap();

        let mut states: States = [a, b, c, d]
            .into_iter()
            .map(|i| (i, TaskState::Pending))
            .collect();

        assert_eq!(ids(&graph, &graph.ready_set(&states).ready), ["a"]);

        states.insert(a, TaskState::SkippedUpToDate);
        assert_eq!(ids(&graph, &graph.ready_set(&states).ready), ["b", "d"]);

        states.insert(b, TaskState::Failed);
        let set = graph.ready_set(&states);
        assert_eq!(ids(&graph, &set.ready), ["d"]);
        assert_eq!(ids(&graph, &set.blocked), ["c"]);
    }

    #[test]
    fn test_mermaid() {
        let graph = chain(&["a", "b"]);
        let rendered = graph.to_string();
        assert!(rendered.starts_with("graph LR\n"));
        assert!(rendered.contains("0[\"a\"]"));
        assert!(rendered.contains("0 --> 1"));
    }
}
