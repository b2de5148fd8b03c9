//! Dependency-aware ready-set tracking.
//!
//! The queue owns an immutable petgraph index of the workflow and answers one
//! question: given the scheduling state of every node, which nodes without a
//! record may run now, and which can never run.

use flowcore::{EdgeKind, NodeId, NodeState, Workflow, WorkflowError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// Nodes unlocked by one call to [`ExecutionQueue::next_ready`], in workflow
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyBatch {
    pub ready: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
}

impl ReadyBatch {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skipped.is_empty()
    }
}

enum Gate {
    Wait,
    Ready,
    Skip,
}

pub struct ExecutionQueue {
    graph: DiGraph<NodeId, EdgeKind>,
    index: HashMap<NodeId, NodeIndex>,
}

impl ExecutionQueue {
    /// Build the index. Fails on an edge naming an unknown node.
    pub fn new(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &workflow.nodes {
            index
                .entry(node.id.clone())
                .or_insert_with(|| graph.add_node(node.id.clone()));
        }

        for edge in &workflow.edges {
            let source = *index
                .get(&edge.source)
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.source.clone()))?;
            let target = *index
                .get(&edge.target)
                .ok_or_else(|| WorkflowError::NodeNotFound(edge.target.clone()))?;
            graph.add_edge(source, target, edge.kind);
        }

        Ok(Self { graph, index })
    }

    /// Classify every node that has no state yet. `state_of` reports the
    /// current scheduling state of a node, `None` if it has no record.
    pub fn next_ready<F>(&self, state_of: F) -> ReadyBatch
    where
        F: Fn(&str) -> Option<NodeState>,
    {
        let mut batch = ReadyBatch::default();
        for idx in self.graph.node_indices() {
            let id = &self.graph[idx];
            if state_of(id.as_str()).is_some() {
                continue;
            }
            match self.gate(idx, &state_of) {
                Gate::Ready => batch.ready.push(id.clone()),
                Gate::Skip => batch.skipped.push(id.clone()),
                Gate::Wait => {}
            }
        }
        batch
    }

    fn gate<F>(&self, idx: NodeIndex, state_of: &F) -> Gate
    where
        F: Fn(&str) -> Option<NodeState>,
    {
        let mut inbound = 0;
        let mut data_edges = 0;
        let mut data_satisfied = 0;
        let mut error_satisfied = false;

        for edge in self.graph.edges_directed(idx, Direction::Incoming) {
            inbound += 1;
            let state = match state_of(self.graph[edge.source()].as_str()) {
                Some(state) if state.is_terminal() => state,
                _ => return Gate::Wait,
            };

            let kind = *edge.weight();
            if kind == EdgeKind::Error {
                error_satisfied |= state == NodeState::Failed;
                continue;
            }
            data_edges += 1;
            if satisfies(kind, state) {
                data_satisfied += 1;
            }
        }

        if inbound == 0 || error_satisfied || (data_edges > 0 && data_satisfied == data_edges) {
            Gate::Ready
        } else {
            Gate::Skip
        }
    }

    /// Nodes with no inbound edges.
    pub fn roots(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Sources of every inbound edge of `node_id`.
    pub fn predecessors(&self, node_id: &str) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };
        let mut preds: Vec<NodeId> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|p| self.graph[p].clone())
            .collect();
        preds.sort();
        preds.dedup();
        preds
    }

    /// Whether a failure of `node_id` is routed to an error edge.
    pub fn has_error_edge(&self, node_id: &str) -> bool {
        self.index.get(node_id).is_some_and(|&idx| {
            self.graph
                .edges_directed(idx, Direction::Outgoing)
                .any(|e| *e.weight() == EdgeKind::Error)
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

fn satisfies(kind: EdgeKind, state: NodeState) -> bool {
    match (kind, state) {
        (EdgeKind::Normal, NodeState::Succeeded { .. }) => true,
        (EdgeKind::ConditionalTrue, NodeState::Succeeded { branch }) => branch == Some(true),
        (EdgeKind::ConditionalFalse, NodeState::Succeeded { branch }) => branch == Some(false),
        (EdgeKind::Error, NodeState::Failed) => true,
        _ => false,
    }
}
