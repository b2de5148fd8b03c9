use crate::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type ExecutionId = Uuid;
pub type NodeId = String;

/// Complete workflow definition. Immutable once submitted for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Add a normal edge.
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.add_edge(source, target, EdgeKind::Normal);
    }

    /// Add the error edge taken when `source` fails after exhausting retries.
    pub fn connect_error(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.add_edge(source, target, EdgeKind::Error);
    }

    /// Add a conditional edge taken when `source` declares `branch`.
    pub fn connect_branch(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        branch: bool,
    ) {
        let kind = if branch {
            EdgeKind::ConditionalTrue
        } else {
            EdgeKind::ConditionalFalse
        };
        self.add_edge(source, target, kind);
    }

    pub fn add_edge(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        kind: EdgeKind,
    ) {
        self.edges.push(Edge {
            source: source.into(),
            target: target.into(),
            kind,
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    /// Display name, also the key under which `$node[...]` exposes the
    /// node's output. Defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: Value::Object(Default::default()),
            retry_policy: None,
            timeout_ms: None,
        }
    }

    /// Set one top-level config key. Replaces a non-object config.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.config.is_object() {
            self.config = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.config {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Replace the whole config tree.
    pub fn with_config_value(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
            max_delay_ms: None,
        });
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Attempts allowed by the retry policy; at least one.
    pub fn max_attempts(&self) -> u32 {
        self.retry_policy
            .as_ref()
            .map(|p| p.max_attempts.max(1))
            .unwrap_or(1)
    }
}

/// Directed link between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Normal,
    Error,
    ConditionalTrue,
    ConditionalFalse,
}

impl EdgeKind {
    pub fn is_conditional(self) -> bool {
        matches!(self, EdgeKind::ConditionalTrue | EdgeKind::ConditionalFalse)
    }
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`, where `attempt` is the
    /// 1-based attempt that just failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let multiplier = self.backoff_multiplier.max(1.0).powi(exponent);
        let mut delay = (self.delay_ms as f64 * multiplier).min(u64::MAX as f64) as u64;
        if let Some(max) = self.max_delay_ms {
            delay = delay.min(max);
        }
        Duration::from_millis(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub on_error: FailurePolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: None,
            on_error: FailurePolicy::FailFast,
        }
    }
}

/// What happens when a node fails with no retries left and no error edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop dispatching new nodes; running siblings finish; the execution fails.
    #[default]
    FailFast,
    /// Keep running branches that do not depend on the failed node; the
    /// execution still ends as failed.
    BestEffort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: Some(300),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(4), Duration::from_millis(300));
    }

    #[test]
    fn workflow_round_trips_through_json() {
        let mut wf = Workflow::new("demo");
        wf.add_node(NodeSpec::new("a", "debug.log"));
        wf.add_node(NodeSpec::new("b", "debug.log").with_config("message", "{{ $json.x }}"));
        wf.connect("a", "b");
        wf.connect_error("a", "b");

        let json = serde_json::to_string(&wf).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.edges, wf.edges);
        assert_eq!(back.nodes[1].config["message"], "{{ $json.x }}");
    }

    #[test]
    fn edge_kind_defaults_to_normal() {
        let edge: Edge = serde_json::from_str(r#"{"source":"a","target":"b"}"#).unwrap();
        assert_eq!(edge.kind, EdgeKind::Normal);
    }
}
