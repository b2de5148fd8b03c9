//! Runtime records: executions, per-attempt node executions and checkpoints.

use crate::error::ErrorInfo;
use crate::workflow::{ExecutionId, NodeId, WorkflowId};
use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

/// Scheduling view of a node: what the queue needs to route edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Has a record that is not final yet (ready, running or awaiting a retry).
    InFlight,
    Succeeded { branch: Option<bool> },
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::InFlight)
    }
}

/// One attempt of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: NodeId,
    pub attempt: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub branch: Option<bool>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    pub fn ready(node_id: impl Into<NodeId>, attempt: u32) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            status: NodeStatus::Ready,
            input: None,
            output: None,
            branch: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn skipped(node_id: impl Into<NodeId>) -> Self {
        let now = Utc::now();
        Self {
            status: NodeStatus::Skipped,
            started_at: Some(now),
            finished_at: Some(now),
            ..Self::ready(node_id, 1)
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Running;
        self.started_at = Some(at);
    }

    pub fn succeed(&mut self, input: Value, output: Value, branch: Option<bool>) {
        self.status = NodeStatus::Success;
        self.input = Some(input);
        self.output = Some(output);
        self.branch = branch;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, input: Option<Value>, error: ErrorInfo) {
        self.status = NodeStatus::Failed;
        self.input = input;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    /// Copy with timestamps cleared, for comparing runs.
    pub fn without_timestamps(&self) -> Self {
        Self {
            started_at: None,
            finished_at: None,
            ..self.clone()
        }
    }
}

/// Structured summary of why an execution did not complete.
pub type ExecutionErrorInfo = ErrorInfo;

/// One run of a workflow against a trigger payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempt history per node, oldest first.
    #[serde(default)]
    pub results: BTreeMap<NodeId, Vec<NodeExecution>>,
    /// Sequence number of the latest persisted checkpoint.
    #[serde(default)]
    pub checkpoint: Option<u64>,
    #[serde(default)]
    pub error: Option<ExecutionErrorInfo>,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default)]
    pub trigger_payload: Value,
}

impl Execution {
    pub fn new(workflow_id: WorkflowId, trigger_payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            results: BTreeMap::new(),
            checkpoint: None,
            error: None,
            recovery_attempts: 0,
            trigger_payload,
        }
    }

    pub fn attempts(&self, node_id: &str) -> &[NodeExecution] {
        self.results.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest(&self, node_id: &str) -> Option<&NodeExecution> {
        self.results.get(node_id).and_then(|a| a.last())
    }

    pub fn latest_mut(&mut self, node_id: &str) -> Option<&mut NodeExecution> {
        self.results.get_mut(node_id).and_then(|a| a.last_mut())
    }

    pub fn push_record(&mut self, record: NodeExecution) {
        self.results
            .entry(record.node_id.clone())
            .or_default()
            .push(record);
    }

    /// Output of the node's successful attempt, if any.
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.latest(node_id)
            .filter(|r| r.status == NodeStatus::Success)
            .and_then(|r| r.output.as_ref())
    }

    /// Scheduling state derived from the latest attempt record.
    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.latest(node_id).map(|record| match record.status {
            NodeStatus::Waiting | NodeStatus::Ready | NodeStatus::Running => NodeState::InFlight,
            NodeStatus::Success => NodeState::Succeeded {
                branch: record.branch,
            },
            NodeStatus::Failed => NodeState::Failed,
            NodeStatus::Skipped => NodeState::Skipped,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Results with timestamps cleared, for comparing two runs.
    pub fn results_without_timestamps(&self) -> BTreeMap<NodeId, Vec<NodeExecution>> {
        self.results
            .iter()
            .map(|(id, attempts)| {
                (
                    id.clone(),
                    attempts.iter().map(NodeExecution::without_timestamps).collect(),
                )
            })
            .collect()
    }
}

/// Durable snapshot of execution progress, written after every terminal node
/// execution and used only to resume after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub sequence: u64,
    pub status: ExecutionStatus,
    pub completed_node_ids: BTreeSet<NodeId>,
    pub node_outputs: BTreeMap<NodeId, Value>,
    /// Full attempt history of every completed node.
    pub records: BTreeMap<NodeId, Vec<NodeExecution>>,
    pub trigger_payload: Value,
    pub started_at: DateTime<Utc>,
    pub recovery_attempts: u32,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Snapshot the nodes in `completed` from `execution`.
    pub fn capture(execution: &Execution, completed: &BTreeSet<NodeId>, sequence: u64) -> Self {
        let records: BTreeMap<NodeId, Vec<NodeExecution>> = completed
            .iter()
            .filter_map(|id| execution.results.get(id).map(|r| (id.clone(), r.clone())))
            .collect();
        let node_outputs = completed
            .iter()
            .filter_map(|id| execution.output(id).map(|o| (id.clone(), o.clone())))
            .collect();

        Self {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            sequence,
            status: execution.status,
            completed_node_ids: completed.clone(),
            node_outputs,
            records,
            trigger_payload: execution.trigger_payload.clone(),
            started_at: execution.started_at,
            recovery_attempts: execution.recovery_attempts,
            error: execution.error.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild the execution state the checkpoint describes. Only completed
    /// nodes are restored; anything in flight at crash time runs again. An
    /// unhandled failure recorded before the crash is carried over.
    pub fn restore(&self) -> Execution {
        let mut results = BTreeMap::new();
        for id in &self.completed_node_ids {
            match self.records.get(id) {
                Some(attempts) => {
                    results.insert(id.clone(), attempts.clone());
                }
                None => {
                    // Older snapshots may carry only outputs.
                    let mut record = NodeExecution::ready(id.clone(), 1);
                    let output = self.node_outputs.get(id).cloned().unwrap_or(Value::Null);
                    record.succeed(Value::Null, output, None);
                    results.insert(id.clone(), vec![record]);
                }
            }
        }

        Execution {
            id: self.execution_id,
            workflow_id: self.workflow_id,
            status: ExecutionStatus::Running,
            started_at: self.started_at,
            finished_at: None,
            results,
            checkpoint: Some(self.sequence),
            error: self.error.clone(),
            recovery_attempts: self.recovery_attempts,
            trigger_payload: self.trigger_payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn checkpoint_restores_only_completed_nodes() {
        let mut execution = Execution::new(Uuid::new_v4(), json!({"x": 1}));
        execution.status = ExecutionStatus::Running;

        let mut a = NodeExecution::ready("a", 1);
        a.succeed(json!({}), json!({"y": 5}), None);
        execution.push_record(a);
        execution.push_record(NodeExecution::ready("b", 1));

        let completed: BTreeSet<NodeId> = ["a".to_string()].into_iter().collect();
        let checkpoint = Checkpoint::capture(&execution, &completed, 1);
        assert_eq!(checkpoint.node_outputs["a"], json!({"y": 5}));

        let restored = checkpoint.restore();
        assert_eq!(restored.output("a"), Some(&json!({"y": 5})));
        assert!(restored.latest("b").is_none());
        assert_eq!(restored.trigger_payload, json!({"x": 1}));
    }

    #[test]
    fn node_state_tracks_latest_attempt() {
        let mut execution = Execution::new(Uuid::new_v4(), Value::Null);
        let mut first = NodeExecution::ready("a", 1);
        first.fail(None, ErrorInfo::new(ErrorKind::NodeHandler, "boom"));
        execution.push_record(first);
        assert_eq!(execution.node_state("a"), Some(NodeState::Failed));

        execution.push_record(NodeExecution::ready("a", 2));
        assert_eq!(execution.node_state("a"), Some(NodeState::InFlight));
        assert_eq!(execution.attempts("a").len(), 2);
    }
}
