use crate::workflow::{ExecutionId, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Recovery exhausted for execution {execution_id} after {attempts} attempts")]
    RecoveryExhausted {
        execution_id: ExecutionId,
        attempts: u32,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by node handlers, plus the timeout/cancellation outcomes the
/// engine imposes on them.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("No checkpoint found for execution {0}")]
    CheckpointNotFound(ExecutionId),

    #[error("Execution {0} is already owned by another recovery")]
    LeaseUnavailable(ExecutionId),

    #[error("Execution {0} already reached a terminal state")]
    AlreadyFinished(ExecutionId),

    #[error("Checkpoint for execution {execution_id} belongs to workflow {found}")]
    WorkflowMismatch {
        execution_id: ExecutionId,
        found: uuid::Uuid,
    },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Expression errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionErrorKind {
    SyntaxError,
    ForbiddenConstruct,
    ResourceExceeded,
    RuntimeError,
}

impl fmt::Display for ExpressionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExpressionErrorKind::SyntaxError => "syntax error",
            ExpressionErrorKind::ForbiddenConstruct => "forbidden construct",
            ExpressionErrorKind::ResourceExceeded => "resource exceeded",
            ExpressionErrorKind::RuntimeError => "runtime error",
        };
        f.write_str(name)
    }
}

/// Failure of a single template evaluation. `offset` is the byte offset into
/// the full template source.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind} at offset {offset}: {message}")]
pub struct ExpressionError {
    pub kind: ExpressionErrorKind,
    pub message: String,
    pub offset: usize,
}

impl ExpressionError {
    pub fn new(kind: ExpressionErrorKind, message: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            message: message.into(),
            offset,
        }
    }

    pub fn syntax(message: impl Into<String>, offset: usize) -> Self {
        Self::new(ExpressionErrorKind::SyntaxError, message, offset)
    }

    pub fn forbidden(message: impl Into<String>, offset: usize) -> Self {
        Self::new(ExpressionErrorKind::ForbiddenConstruct, message, offset)
    }

    pub fn exceeded(message: impl Into<String>, offset: usize) -> Self {
        Self::new(ExpressionErrorKind::ResourceExceeded, message, offset)
    }

    pub fn runtime(message: impl Into<String>, offset: usize) -> Self {
        Self::new(ExpressionErrorKind::RuntimeError, message, offset)
    }

    /// Shift the offset by `base`, used when a block is evaluated on its own.
    pub fn shifted(mut self, base: usize) -> Self {
        self.offset += base;
        self
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A single structural problem found by the workflow validator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("workflow has {count} nodes, above the limit of {max}")]
    TooManyNodes { count: usize, max: usize },

    #[error("duplicate node id '{node_id}'")]
    DuplicateNodeId { node_id: NodeId },

    #[error("edge {source_id} -> {target_id} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: NodeId,
        target_id: NodeId,
        missing: NodeId,
    },

    #[error("node '{node_id}' has no incoming or outgoing edges")]
    OrphanedNode { node_id: NodeId },

    #[error("cycle detected through nodes {}", .path.join(" -> "))]
    Cycle { path: Vec<NodeId> },

    #[error("node '{node_id}' has {count} error edges, at most one is allowed")]
    MultipleErrorEdges { node_id: NodeId, count: usize },

    #[error("conditional edge from '{node_id}' but node type '{node_type}' does not branch")]
    ConditionalFromNonBranching { node_id: NodeId, node_type: String },

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("node '{node_id}' config at '{path}': {error}")]
    InvalidExpression {
        node_id: NodeId,
        path: String,
        error: ExpressionError,
    },
}

/// All issues found in one validation pass.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{}", render_issues(.0))]
pub struct ValidationErrors(pub Vec<ValidationIssue>);

impl ValidationErrors {
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.0
    }

    pub fn contains(&self, predicate: impl Fn(&ValidationIssue) -> bool) -> bool {
        self.0.iter().any(predicate)
    }
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Structured error attached to node executions and executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SyntaxError,
    ForbiddenConstruct,
    ResourceExceeded,
    ExpressionRuntime,
    NodeHandler,
    Timeout,
    Cancelled,
    RecoveryExhausted,
    Checkpoint,
}

/// User-facing error record: kind, message and the node that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

impl From<&NodeError> for ErrorInfo {
    fn from(err: &NodeError) -> Self {
        let kind = match err {
            NodeError::Timeout { .. } => ErrorKind::Timeout,
            NodeError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::NodeHandler,
        };
        ErrorInfo::new(kind, err.to_string())
    }
}

impl From<&ExpressionError> for ErrorInfo {
    fn from(err: &ExpressionError) -> Self {
        let kind = match err.kind {
            ExpressionErrorKind::SyntaxError => ErrorKind::SyntaxError,
            ExpressionErrorKind::ForbiddenConstruct => ErrorKind::ForbiddenConstruct,
            ExpressionErrorKind::ResourceExceeded => ErrorKind::ResourceExceeded,
            ExpressionErrorKind::RuntimeError => ErrorKind::ExpressionRuntime,
        };
        ErrorInfo::new(kind, err.to_string())
    }
}
