//! Static checks on a workflow graph before it runs.
//!
//! The graph is modelled with `petgraph`; cycles are found with a DFS that
//! marks the nodes on the current path. Every issue is collected so a caller
//! sees all problems in one pass.

use crate::error::{ValidationErrors, ValidationIssue};
use crate::expression::ExpressionEngine;
use crate::node::NodeTypeCatalog;
use crate::workflow::{EdgeKind, NodeId, Workflow};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_nodes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { max_nodes: 500 }
    }
}

/// Validate with default limits and no node-type catalog.
pub fn validate(workflow: &Workflow) -> Result<(), ValidationErrors> {
    Validator::new(ValidationConfig::default()).validate(workflow)
}

pub struct Validator<'a> {
    config: ValidationConfig,
    catalog: Option<&'a dyn NodeTypeCatalog>,
    expressions: ExpressionEngine,
}

impl<'a> Validator<'a> {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            catalog: None,
            expressions: ExpressionEngine::default(),
        }
    }

    /// Also check node types and branching declarations against `catalog`.
    pub fn with_catalog(mut self, catalog: &'a dyn NodeTypeCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_expression_engine(mut self, expressions: ExpressionEngine) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn validate(&self, workflow: &Workflow) -> Result<(), ValidationErrors> {
        let issues = self.issues(workflow);
        if issues.is_empty() {
            debug!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), "Workflow validated");
            Ok(())
        } else {
            debug!(workflow_id = %workflow.id, issues = issues.len(), "Workflow rejected");
            Err(ValidationErrors(issues))
        }
    }

    pub fn issues(&self, workflow: &Workflow) -> Vec<ValidationIssue> {
        if workflow.nodes.is_empty() {
            return vec![ValidationIssue::EmptyWorkflow];
        }

        let mut issues = Vec::new();
        if workflow.nodes.len() > self.config.max_nodes {
            issues.push(ValidationIssue::TooManyNodes {
                count: workflow.nodes.len(),
                max: self.config.max_nodes,
            });
        }

        let mut graph = DiGraph::<&str, EdgeKind>::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &workflow.nodes {
            if index.contains_key(node.id.as_str()) {
                issues.push(ValidationIssue::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
                continue;
            }
            index.insert(&node.id, graph.add_node(&node.id));
        }

        let mut connected: HashSet<&str> = HashSet::new();
        let mut error_edges: HashMap<&str, usize> = HashMap::new();
        for edge in &workflow.edges {
            let missing = [&edge.source, &edge.target]
                .into_iter()
                .find(|id| !index.contains_key(id.as_str()));
            if let Some(missing) = missing {
                issues.push(ValidationIssue::DanglingEdge {
                    source_id: edge.source.clone(),
                    target_id: edge.target.clone(),
                    missing: missing.clone(),
                });
                continue;
            }

            connected.insert(&edge.source);
            connected.insert(&edge.target);
            if edge.kind == EdgeKind::Error {
                *error_edges.entry(&edge.source).or_default() += 1;
            }

            if edge.source == edge.target {
                issues.push(ValidationIssue::Cycle {
                    path: vec![edge.source.clone(), edge.target.clone()],
                });
                continue;
            }
            graph.add_edge(index[edge.source.as_str()], index[edge.target.as_str()], edge.kind);
        }

        if workflow.nodes.len() > 1 {
            for node in &workflow.nodes {
                if !connected.contains(node.id.as_str()) {
                    issues.push(ValidationIssue::OrphanedNode {
                        node_id: node.id.clone(),
                    });
                }
            }
        }

        for node in &workflow.nodes {
            let count = error_edges.get(node.id.as_str()).copied().unwrap_or(0);
            if count > 1 {
                issues.push(ValidationIssue::MultipleErrorEdges {
                    node_id: node.id.clone(),
                    count,
                });
            }
        }

        issues.extend(find_cycles(&graph));

        if let Some(catalog) = self.catalog {
            self.check_types(workflow, catalog, &mut issues);
        }

        for node in &workflow.nodes {
            for (path, error) in self.expressions.check_config(&node.config) {
                issues.push(ValidationIssue::InvalidExpression {
                    node_id: node.id.clone(),
                    path,
                    error,
                });
            }
        }

        issues
    }

    fn check_types(
        &self,
        workflow: &Workflow,
        catalog: &dyn NodeTypeCatalog,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for node in &workflow.nodes {
            if !catalog.is_known(&node.node_type) {
                issues.push(ValidationIssue::UnknownNodeType {
                    node_id: node.id.clone(),
                    node_type: node.node_type.clone(),
                });
            }
        }

        let mut reported: HashSet<&str> = HashSet::new();
        for edge in workflow.edges.iter().filter(|e| e.kind.is_conditional()) {
            let Some(source) = workflow.find_node(&edge.source) else {
                continue;
            };
            if catalog.is_known(&source.node_type)
                && !catalog.declares_branching(&source.node_type)
                && reported.insert(&source.id)
            {
                issues.push(ValidationIssue::ConditionalFromNonBranching {
                    node_id: source.id.clone(),
                    node_type: source.node_type.clone(),
                });
            }
        }
    }
}

/// One `Cycle` issue per back edge found by an iterative DFS. Error edges
/// count like any other edge.
fn find_cycles(graph: &DiGraph<&str, EdgeKind>) -> Vec<ValidationIssue> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut issues = Vec::new();

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }
        // (node, its successors, next successor to visit)
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
        marks[root.index()] = Mark::OnPath;
        stack.push((root, successors(graph, root), 0));

        while let Some((node, next, cursor)) = stack.last_mut() {
            let Some(&succ) = next.get(*cursor) else {
                marks[node.index()] = Mark::Done;
                stack.pop();
                continue;
            };
            *cursor += 1;

            match marks[succ.index()] {
                Mark::Unvisited => {
                    marks[succ.index()] = Mark::OnPath;
                    stack.push((succ, successors(graph, succ), 0));
                }
                Mark::OnPath => {
                    let start = stack.iter().position(|(n, _, _)| *n == succ).unwrap_or(0);
                    let mut path: Vec<NodeId> = stack[start..]
                        .iter()
                        .map(|(n, _, _)| graph[*n].to_string())
                        .collect();
                    path.push(graph[succ].to_string());
                    issues.push(ValidationIssue::Cycle { path });
                }
                Mark::Done => {}
            }
        }
    }
    issues
}

/// Successors in edge insertion order.
fn successors(graph: &DiGraph<&str, EdgeKind>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut out: Vec<_> = graph.neighbors(node).collect();
    // petgraph yields the most recently added edge first.
    out.reverse();
    out.dedup();
    out
}
