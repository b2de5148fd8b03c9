use crate::events::EventEmitter;
use crate::value::{Value, ValueExt};
use crate::workflow::{ExecutionId, NodeId};
use crate::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable node handlers implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "http.request", "transform.set")
    fn node_type(&self) -> &str;

    /// Static description of the handler. Branching handlers must report
    /// their outcome through [`NodeOutput::branch`].
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type())
    }

    /// Execute the node. `input` is the node's config with every expression
    /// already resolved.
    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Validate configuration at workflow load time
    fn validate_config(&self, _config: &Value) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node attempt
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,

    /// 1-based attempt number
    pub attempt: u32,

    /// Outputs of the satisfied upstream edges (`$items`)
    pub items: Vec<Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancelled on timeout or when the execution is cancelled
    pub cancellation: CancellationToken,

    /// When the attempt times out, if it has a timeout
    pub deadline: Option<Instant>,
}

impl NodeContext {
    pub fn new(execution_id: ExecutionId, node_id: impl Into<NodeId>, events: EventEmitter) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            attempt: 1,
            items: Vec::new(),
            events,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    /// First upstream item (`$json`), or null.
    pub fn json(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.items.first().unwrap_or(&NULL)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Get a required field of a resolved input object
pub fn require_field<'a>(input: &'a Value, name: &str) -> Result<&'a Value, NodeError> {
    match input.get(name) {
        Some(Value::Null) | None => Err(NodeError::MissingInput(name.to_string())),
        Some(value) => Ok(value),
    }
}

/// Get a required string field
pub fn require_str<'a>(input: &'a Value, name: &str) -> Result<&'a str, NodeError> {
    let value = require_field(input, name)?;
    value.as_str().ok_or_else(|| NodeError::InvalidInputType {
        field: name.to_string(),
        expected: "string".to_string(),
        actual: value.type_name().to_string(),
    })
}

/// Get an optional field with default
pub fn field_or(input: &Value, name: &str, default: Value) -> Value {
    match input.get(name) {
        Some(Value::Null) | None => default,
        Some(value) => value.clone(),
    }
}

/// Output from node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub data: Value,

    /// Declared outcome of a branching node; selects the conditional edges
    #[serde(default)]
    pub branch: Option<bool>,
}

impl NodeOutput {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: bool) -> Self {
        self.branch = Some(branch);
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}

impl From<Value> for NodeOutput {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// Metadata about a node handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_type: String,
    #[serde(default)]
    pub description: String,
    /// Whether the handler declares a true/false outcome
    #[serde(default)]
    pub branching: bool,
}

impl NodeMetadata {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            description: String::new(),
            branching: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn branching(mut self) -> Self {
        self.branching = true;
        self
    }
}

/// Node types known to a registry, as seen by the validator
pub trait NodeTypeCatalog {
    fn is_known(&self, node_type: &str) -> bool;

    fn declares_branching(&self, node_type: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_fields() {
        let input = json!({"url": "http://x", "n": 1, "empty": null});
        assert_eq!(require_str(&input, "url").unwrap(), "http://x");
        assert!(matches!(
            require_str(&input, "n"),
            Err(NodeError::InvalidInputType { .. })
        ));
        assert!(matches!(
            require_field(&input, "empty"),
            Err(NodeError::MissingInput(_))
        ));
        assert_eq!(field_or(&input, "missing", json!(5)), json!(5));
    }
}
