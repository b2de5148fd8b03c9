// crates/flowruntime/tests/common/mod.rs

#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    Checkpoint, CheckpointError, ExecutionId, Node, NodeContext, NodeError, NodeExecution,
    NodeMetadata, NodeOutput, Value, ValueExt,
};
use flowruntime::{CheckpointStore, ExecutionHooks, InMemoryCheckpointStore, NodeRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Returns its resolved input.
pub struct EchoNode;

#[async_trait]
impl Node for EchoNode {
    fn node_type(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new(input))
    }
}

/// Always fails.
pub struct FailNode;

#[async_trait]
impl Node for FailNode {
    fn node_type(&self) -> &str {
        "test.fail"
    }

    async fn execute(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Err(NodeError::ExecutionFailed("boom".to_string()))
    }
}

/// Fails until attempt `succeed_on`.
pub struct FlakyNode;

#[async_trait]
impl Node for FlakyNode {
    fn node_type(&self) -> &str {
        "test.flaky"
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let succeed_on = input["succeed_on"].as_u64().unwrap_or(2) as u32;
        if ctx.attempt < succeed_on {
            return Err(NodeError::ExecutionFailed(format!(
                "attempt {} failed",
                ctx.attempt
            )));
        }
        Ok(NodeOutput::new(serde_json::json!({ "attempt": ctx.attempt })))
    }
}

/// Sleeps for `ms` milliseconds unless cancelled first.
pub struct SleepNode;

#[async_trait]
impl Node for SleepNode {
    fn node_type(&self) -> &str {
        "test.sleep"
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let ms = input["ms"].as_u64().unwrap_or(10);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(NodeOutput::new(input)),
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
        }
    }
}

/// Declares the truthiness of `value` as its branch.
pub struct BranchNode;

#[async_trait]
impl Node for BranchNode {
    fn node_type(&self) -> &str {
        "test.branch"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type()).branching()
    }

    async fn execute(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let branch = input["value"].is_truthy();
        Ok(NodeOutput::new(input).with_branch(branch))
    }
}

/// Sleeps briefly and records the highest number of concurrent calls.
#[derive(Default)]
pub struct GaugeNode {
    pub current: AtomicUsize,
    pub peak: AtomicUsize,
}

#[async_trait]
impl Node for GaugeNode {
    fn node_type(&self) -> &str {
        "test.gauge"
    }

    async fn execute(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput::new(input))
    }
}

pub fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register_node(EchoNode);
    registry.register_node(FailNode);
    registry.register_node(FlakyNode);
    registry.register_node(SleepNode);
    registry.register_node(BranchNode);
    registry
}

/// Hook calls as `start:a:1`, `complete:a:1` and `error:a:1:retry`.
#[derive(Default)]
pub struct RecordingHooks {
    pub calls: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ExecutionHooks for RecordingHooks {
    fn on_node_start(&self, _execution_id: ExecutionId, record: &NodeExecution) {
        let call = format!("start:{}:{}", record.node_id, record.attempt);
        self.calls.lock().unwrap().push(call);
    }

    fn on_node_complete(&self, _execution_id: ExecutionId, record: &NodeExecution) {
        let call = format!("complete:{}:{}", record.node_id, record.attempt);
        self.calls.lock().unwrap().push(call);
    }

    fn on_node_error(&self, _execution_id: ExecutionId, record: &NodeExecution, will_retry: bool) {
        let outcome = if will_retry { "retry" } else { "final" };
        let call = format!("error:{}:{}:{}", record.node_id, record.attempt, outcome);
        self.calls.lock().unwrap().push(call);
    }
}

/// In-memory store that also keeps every checkpoint it was asked to save.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryCheckpointStore,
    pub saved: Mutex<Vec<Checkpoint>>,
}

impl RecordingStore {
    pub fn saved(&self) -> Vec<Checkpoint> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.saved.lock().unwrap().push(checkpoint.clone());
        self.inner.save(checkpoint).await
    }

    async fn load_latest(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load_latest(execution_id).await
    }

    async fn acquire_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<bool, CheckpointError> {
        self.inner.acquire_lease(execution_id, owner).await
    }

    async fn release_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<(), CheckpointError> {
        self.inner.release_lease(execution_id, owner).await
    }
}

/// Store whose saves fail from sequence `fail_from` on.
pub struct BrokenStore {
    inner: InMemoryCheckpointStore,
    fail_from: u64,
}

impl BrokenStore {
    pub fn failing_from(fail_from: u64) -> Self {
        Self {
            inner: InMemoryCheckpointStore::new(),
            fail_from,
        }
    }
}

#[async_trait]
impl CheckpointStore for BrokenStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.sequence >= self.fail_from {
            return Err(CheckpointError::Storage("disk full".to_string()));
        }
        self.inner.save(checkpoint).await
    }

    async fn load_latest(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load_latest(execution_id).await
    }

    async fn acquire_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<bool, CheckpointError> {
        self.inner.acquire_lease(execution_id, owner).await
    }

    async fn release_lease(
        &self,
        execution_id: ExecutionId,
        owner: Uuid,
    ) -> Result<(), CheckpointError> {
        self.inner.release_lease(execution_id, owner).await
    }
}

pub fn shared(registry: NodeRegistry) -> Arc<NodeRegistry> {
    Arc::new(registry)
}
