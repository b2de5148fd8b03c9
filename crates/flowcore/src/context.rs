//! Evaluation context for node configuration expressions.

use crate::execution::{Execution, NodeState};
use crate::value::{Map, Value};
use crate::workflow::{EdgeKind, ExecutionId, NodeId, Workflow, WorkflowId};
use crate::expression::format_timestamp;
use chrono::{DateTime, Utc};
use serde_json::json;

/// Read-only variables visible to an expression: `$json`, `$items`,
/// `$node`, `$workflow`, `$execution`, `$env` and `$now`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionContext {
    json: Value,
    items: Value,
    node: Value,
    workflow: Value,
    execution: Value,
    env: Value,
    now: DateTime<Utc>,
    now_value: Value,
}

impl Default for ExpressionContext {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            json: Value::Null,
            items: Value::Array(Vec::new()),
            node: Value::Object(Map::new()),
            workflow: Value::Object(Map::new()),
            execution: Value::Object(Map::new()),
            env: Value::Object(Map::new()),
            now,
            now_value: Value::String(format_timestamp(&now)),
        }
    }
}

impl ExpressionContext {
    /// Context whose `$json` is `json` and `$items` is `[json]`.
    pub fn new(json: Value) -> Self {
        Self {
            items: Value::Array(vec![json.clone()]),
            json,
            ..Self::default()
        }
    }

    /// Set `$items`; `$json` becomes the first item (or null).
    pub fn with_items(mut self, items: Vec<Value>) -> Self {
        self.json = items.first().cloned().unwrap_or(Value::Null);
        self.items = Value::Array(items);
        self
    }

    pub fn with_node_output(mut self, name: impl Into<String>, output: Value) -> Self {
        if let Value::Object(map) = &mut self.node {
            map.insert(name.into(), output);
        }
        self
    }

    pub fn with_workflow(mut self, id: WorkflowId, name: &str) -> Self {
        self.workflow = json!({ "id": id.to_string(), "name": name });
        self
    }

    pub fn with_execution(mut self, id: ExecutionId, started_at: DateTime<Utc>) -> Self {
        self.execution = json!({
            "id": id.to_string(),
            "startedAt": format_timestamp(&started_at),
        });
        self
    }

    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = Value::Object(env);
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self.now_value = Value::String(format_timestamp(&now));
        self
    }

    /// Value of a `$name` variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        match name {
            "$json" => Some(&self.json),
            "$items" => Some(&self.items),
            "$node" => Some(&self.node),
            "$workflow" => Some(&self.workflow),
            "$execution" => Some(&self.execution),
            "$env" => Some(&self.env),
            "$now" => Some(&self.now_value),
            _ => None,
        }
    }

    pub fn json(&self) -> &Value {
        &self.json
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// Assembles the [`ExpressionContext`] for a node about to run.
///
/// The result depends only on the workflow, the recorded node results, the
/// trigger payload, the env allowlist and the captured `now`, so rebuilding it
/// after a resume yields the same context.
pub struct ContextBuilder<'a> {
    workflow: &'a Workflow,
    env: &'a Map<String, Value>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(workflow: &'a Workflow, env: &'a Map<String, Value>) -> Self {
        Self { workflow, env }
    }

    pub fn build(&self, execution: &Execution, node_id: &str, now: DateTime<Utc>) -> ExpressionContext {
        let mut ctx = ExpressionContext::default()
            .with_items(self.upstream_items(execution, node_id))
            .with_workflow(self.workflow.id, &self.workflow.name)
            .with_execution(execution.id, execution.started_at)
            .with_env(self.env.clone())
            .with_now(now);

        for spec in &self.workflow.nodes {
            if let Some(output) = execution.output(&spec.id) {
                ctx = ctx.with_node_output(spec.display_name(), output.clone());
            }
        }
        ctx
    }

    /// Outputs of the satisfied inbound edges in declaration order. A root
    /// node sees the trigger payload; a node reached over an error edge sees
    /// `{"error": {...}}` describing the failure.
    pub fn upstream_items(&self, execution: &Execution, node_id: &str) -> Vec<Value> {
        let mut inbound = self
            .workflow
            .edges
            .iter()
            .filter(|edge| edge.target == node_id)
            .peekable();
        if inbound.peek().is_none() {
            return vec![execution.trigger_payload.clone()];
        }

        let mut seen: Vec<&NodeId> = Vec::new();
        let mut items = Vec::new();
        for edge in inbound {
            let item = match (edge.kind, execution.node_state(&edge.source)) {
                (EdgeKind::Normal, Some(NodeState::Succeeded { .. })) => {
                    execution.output(&edge.source).cloned()
                }
                (EdgeKind::ConditionalTrue, Some(NodeState::Succeeded { branch: Some(true) }))
                | (EdgeKind::ConditionalFalse, Some(NodeState::Succeeded { branch: Some(false) })) => {
                    execution.output(&edge.source).cloned()
                }
                (EdgeKind::Error, Some(NodeState::Failed)) => Some(failure_item(execution, &edge.source)),
                _ => None,
            };
            if let Some(item) = item {
                if !seen.contains(&&edge.source) {
                    seen.push(&edge.source);
                    items.push(item);
                }
            }
        }
        items
    }
}

fn failure_item(execution: &Execution, node_id: &str) -> Value {
    let record = execution.latest(node_id);
    let error = record
        .and_then(|r| r.error.clone())
        .map(|e| if e.node_id.is_none() { e.at_node(node_id) } else { e });
    let mut error = serde_json::to_value(&error).unwrap_or_default();
    if let (Value::Object(map), Some(record)) = (&mut error, record) {
        map.insert("attempt".into(), Value::from(record.attempt));
    }
    json!({ "error": error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorInfo, ErrorKind};
    use crate::execution::NodeExecution;
    use crate::workflow::NodeSpec;

    fn workflow() -> Workflow {
        let mut wf = Workflow::new("ctx");
        wf.add_node(NodeSpec::new("fetch", "noop").with_name("Fetch"));
        wf.add_node(NodeSpec::new("check", "logic.if"));
        wf.add_node(NodeSpec::new("yes", "noop"));
        wf.add_node(NodeSpec::new("recover", "noop"));
        wf.connect("fetch", "check");
        wf.connect_branch("check", "yes", true);
        wf.connect_error("check", "recover");
        wf
    }

    #[test]
    fn root_sees_trigger_payload() {
        let wf = workflow();
        let env = Map::new();
        let execution = Execution::new(wf.id, json!({"id": 7}));
        let ctx = ContextBuilder::new(&wf, &env).build(&execution, "fetch", Utc::now());
        assert_eq!(ctx.json(), &json!({"id": 7}));
        assert_eq!(ctx.variable("$items"), Some(&json!([{"id": 7}])));
    }

    #[test]
    fn node_outputs_are_keyed_by_display_name() {
        let wf = workflow();
        let env = Map::new();
        let mut execution = Execution::new(wf.id, Value::Null);
        let mut fetch = NodeExecution::ready("fetch", 1);
        fetch.succeed(Value::Null, json!({"rows": 3}), None);
        execution.push_record(fetch);

        let ctx = ContextBuilder::new(&wf, &env).build(&execution, "check", Utc::now());
        assert_eq!(ctx.json(), &json!({"rows": 3}));
        assert_eq!(ctx.variable("$node"), Some(&json!({"Fetch": {"rows": 3}})));
    }

    #[test]
    fn branch_and_error_routes() {
        let wf = workflow();
        let env = Map::new();
        let builder = ContextBuilder::new(&wf, &env);

        let mut execution = Execution::new(wf.id, Value::Null);
        let mut check = NodeExecution::ready("check", 1);
        check.succeed(Value::Null, json!({"ok": true}), Some(true));
        execution.push_record(check);
        assert_eq!(builder.upstream_items(&execution, "yes"), vec![json!({"ok": true})]);

        let mut failed = Execution::new(wf.id, Value::Null);
        let mut check = NodeExecution::ready("check", 2);
        check.fail(None, ErrorInfo::new(ErrorKind::NodeHandler, "boom"));
        failed.push_record(check);
        let items = builder.upstream_items(&failed, "recover");
        assert_eq!(items[0]["error"]["message"], "boom");
        assert_eq!(items[0]["error"]["node_id"], "check");
        assert_eq!(items[0]["error"]["attempt"], 2);
    }
}
