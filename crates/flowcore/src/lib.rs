//! Core abstractions for the flow engine
//!
//! This crate provides the workflow and execution data model, the error
//! types, the sandboxed expression language, the per-node context builder
//! and the static workflow validator. Scheduling lives in `flowruntime`.

mod context;
mod error;
pub mod events;
mod execution;
pub mod expression;
mod node;
mod validator;
mod value;
mod workflow;

pub use context::{ContextBuilder, ExpressionContext};
pub use error::{
    CheckpointError, ErrorInfo, ErrorKind, ExpressionError, ExpressionErrorKind, FlowError,
    NodeError, ValidationErrors, ValidationIssue, WorkflowError,
};
pub use events::*;
pub use execution::{
    Checkpoint, Execution, ExecutionErrorInfo, ExecutionStatus, NodeExecution, NodeState,
    NodeStatus,
};
pub use expression::{ExpressionEngine, ExpressionLimits};
pub use node::{
    field_or, require_field, require_str, Node, NodeContext, NodeMetadata, NodeOutput,
    NodeTypeCatalog,
};
pub use validator::{validate, ValidationConfig, Validator};
pub use value::{loose_eq, Map, Value, ValueExt};
pub use workflow::{
    Edge, EdgeKind, ExecutionId, FailurePolicy, NodeId, NodeSpec, RetryPolicy, Workflow,
    WorkflowId, WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
