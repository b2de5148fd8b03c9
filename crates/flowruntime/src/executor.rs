use crate::checkpoint::{CheckpointStore, CheckpointWriter};
use crate::queue::ExecutionQueue;
use crate::registry::NodeRegistry;
use chrono::{DateTime, Utc};
use flowcore::{
    Checkpoint, CheckpointError, ContextBuilder, ErrorInfo, ErrorKind, EventBus, Execution,
    ExecutionEvent, ExecutionId, ExecutionStatus, ExpressionEngine, FailurePolicy, FlowError, Map,
    NodeContext, NodeError, NodeExecution, NodeId, NodeOutput, NodeState, NodeStatus, Value,
    Workflow,
};
use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Synchronous notifications about node progress. They observe the run and
/// cannot change it.
pub trait ExecutionHooks: Send + Sync {
    fn on_node_start(&self, _execution_id: ExecutionId, _record: &NodeExecution) {}

    fn on_node_complete(&self, _execution_id: ExecutionId, _record: &NodeExecution) {}

    fn on_node_error(&self, _execution_id: ExecutionId, _record: &NodeExecution, _will_retry: bool) {}
}

/// Hooks that ignore every notification.
pub struct NoHooks;

impl ExecutionHooks for NoHooks {}

/// Drives one execution of a workflow to a terminal state.
///
/// Ready nodes are dispatched as tokio tasks, up to `max_parallel` at a
/// time, and their completions are collected through a `FuturesUnordered`.
/// All mutation of the [`Execution`] happens on the scheduling loop.
pub struct WorkflowExecutor {
    workflow: Arc<Workflow>,
    registry: Arc<NodeRegistry>,
    events: EventBus,
    expressions: ExpressionEngine,
    env: Map<String, Value>,
    hooks: Arc<dyn ExecutionHooks>,
    store: Option<Arc<dyn CheckpointStore>>,
    cancel: CancellationToken,
    max_parallel: usize,
    default_timeout_ms: u64,
}

impl WorkflowExecutor {
    pub fn new(workflow: Arc<Workflow>, registry: Arc<NodeRegistry>, events: EventBus) -> Self {
        Self {
            workflow,
            registry,
            events,
            expressions: ExpressionEngine::default(),
            env: Map::new(),
            hooks: Arc::new(NoHooks),
            store: None,
            cancel: CancellationToken::new(),
            max_parallel: 10,
            default_timeout_ms: 300_000,
        }
    }

    pub fn with_expression_engine(mut self, expressions: ExpressionEngine) -> Self {
        self.expressions = expressions;
        self
    }

    /// Values exposed as `$env`.
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Persist a checkpoint after every node that reaches a final state.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Token that cancels the execution when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `execution` until no node can make progress. A restored execution
    /// keeps its completed nodes and only runs what is left.
    pub async fn run(self, mut execution: Execution) -> Result<Execution, FlowError> {
        let queue = ExecutionQueue::new(&self.workflow)?;
        let resumed = execution.checkpoint.is_some();
        let clock = Instant::now();

        execution.status = ExecutionStatus::Running;
        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %self.workflow.id,
            resumed,
            "Starting workflow execution"
        );
        self.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id: execution.id,
            workflow_id: self.workflow.id,
            resumed,
            timestamp: Utc::now(),
        });

        let completed: BTreeSet<NodeId> = execution
            .results
            .keys()
            .filter(|id| execution.node_state(id).is_some_and(NodeState::is_terminal))
            .cloned()
            .collect();
        let deadline = self.execution_deadline(&execution);
        // A checkpoint taken after an unhandled failure resumes halted.
        let halted = execution.error.is_some()
            && self.workflow.settings.on_error == FailurePolicy::FailFast;

        let mut run = Run {
            executor: &self,
            queue,
            sequence: execution.checkpoint.unwrap_or(0),
            restored_from: execution.checkpoint,
            execution,
            pending: VecDeque::new(),
            running: FuturesUnordered::new(),
            in_flight: 0,
            retrying: HashSet::new(),
            completed,
            halted,
            retry_stop: self.cancel.child_token(),
            writer: self
                .store
                .clone()
                .map(|store| CheckpointWriter::spawn(store, self.events.clone())),
        };

        let timed_out = run.drive(deadline).await;
        Ok(run.finish(timed_out, clock).await)
    }

    fn execution_deadline(&self, execution: &Execution) -> Option<Instant> {
        let limit = Duration::from_millis(self.workflow.settings.max_execution_time_ms?);
        let elapsed = (Utc::now() - execution.started_at)
            .to_std()
            .unwrap_or_default();
        Some(Instant::now() + limit.saturating_sub(elapsed))
    }
}

enum Completion {
    Attempt {
        node_id: NodeId,
        attempt: u32,
        input: Option<Value>,
        outcome: Result<NodeOutput, ErrorInfo>,
        started: Instant,
    },
    RetryDue {
        node_id: NodeId,
    },
}

struct Run<'a> {
    executor: &'a WorkflowExecutor,
    queue: ExecutionQueue,
    execution: Execution,
    /// Nodes with a `Ready` record waiting for a free slot.
    pending: VecDeque<NodeId>,
    running: FuturesUnordered<BoxFuture<'static, Completion>>,
    /// Attempts dispatched and not yet completed. Retry timers do not count.
    in_flight: usize,
    /// Nodes waiting out a retry delay.
    retrying: HashSet<NodeId>,
    /// Nodes whose final record is terminal; exactly what a checkpoint keeps.
    completed: BTreeSet<NodeId>,
    sequence: u64,
    /// Checkpoint the run was resumed from, already stored.
    restored_from: Option<u64>,
    /// Set by a fail-fast failure: nothing new is dispatched.
    halted: bool,
    retry_stop: CancellationToken,
    writer: Option<CheckpointWriter>,
}

impl Run<'_> {
    fn stopped(&self) -> bool {
        self.halted || self.executor.cancel.is_cancelled()
    }

    /// Returns true if the execution deadline fired.
    async fn drive(&mut self, deadline: Option<Instant>) -> bool {
        let mut timed_out = false;

        loop {
            let now = Utc::now();
            if !self.stopped() {
                self.schedule_ready();
            }
            while self.in_flight < self.executor.max_parallel && !self.stopped() {
                let Some(node_id) = self.pending.pop_front() else {
                    break;
                };
                self.dispatch(node_id, now);
            }

            if self.running.is_empty() {
                break;
            }

            let next = match deadline {
                Some(at) if !timed_out => tokio::select! {
                    completion = self.running.next() => completion,
                    _ = tokio::time::sleep_until(at) => {
                        timed_out = true;
                        None
                    }
                },
                _ => self.running.next().await,
            };

            match next {
                Some(completion) => self.complete(completion),
                None if timed_out && !self.executor.cancel.is_cancelled() => {
                    tracing::warn!(
                        execution_id = %self.execution.id,
                        "Execution exceeded its time limit, cancelling"
                    );
                    self.executor.cancel.cancel();
                }
                None if timed_out => {}
                None => break,
            }
        }

        timed_out
    }

    /// Record every node the queue can classify right now.
    fn schedule_ready(&mut self) {
        loop {
            let batch = {
                let execution = &self.execution;
                self.queue.next_ready(|id| execution.node_state(id))
            };
            if batch.is_empty() {
                break;
            }

            for node_id in batch.skipped {
                tracing::debug!(
                    execution_id = %self.execution.id,
                    node_id = %node_id,
                    "Skipping node, no inbound edge was taken"
                );
                self.execution.push_record(NodeExecution::skipped(node_id.clone()));
                self.executor.events.emit(ExecutionEvent::NodeSkipped {
                    execution_id: self.execution.id,
                    node_id: node_id.clone(),
                    timestamp: Utc::now(),
                });
                self.mark_completed(node_id);
            }

            for node_id in batch.ready {
                self.execution.push_record(NodeExecution::ready(node_id.clone(), 1));
                self.pending.push_back(node_id);
            }
        }
    }

    fn dispatch(&mut self, node_id: NodeId, now: DateTime<Utc>) {
        let executor = self.executor;
        let execution_id = self.execution.id;
        let Some(spec) = executor.workflow.find_node(&node_id) else {
            return;
        };

        let builder = ContextBuilder::new(&executor.workflow, &executor.env);
        let ctx = builder.build(&self.execution, &node_id, now);
        let items = builder.upstream_items(&self.execution, &node_id);
        let resolved = executor.expressions.resolve_config(&spec.config, &ctx);

        let Some(record) = self.execution.latest_mut(&node_id) else {
            return;
        };
        let attempt = record.attempt;
        record.start(now);
        if let Ok(input) = &resolved {
            record.input = Some(input.clone());
        }
        executor.hooks.on_node_start(execution_id, record);

        tracing::debug!(
            execution_id = %execution_id,
            node_id = %node_id,
            node_type = %spec.node_type,
            attempt,
            "Dispatching node"
        );
        executor.events.emit(ExecutionEvent::NodeStarted {
            execution_id,
            node_id: node_id.clone(),
            node_type: spec.node_type.clone(),
            attempt,
            timestamp: Utc::now(),
        });

        self.in_flight += 1;
        let started = Instant::now();

        let input = match resolved {
            Ok(input) => input,
            Err(e) => {
                let error = ErrorInfo::from(&e).at_node(&node_id);
                self.running.push(Box::pin(future::ready(Completion::Attempt {
                    node_id,
                    attempt,
                    input: None,
                    outcome: Err(error),
                    started,
                })));
                return;
            }
        };

        let timeout_ms = spec.timeout_ms.unwrap_or(executor.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);
        let token = executor.cancel.child_token();

        let mut node_ctx = NodeContext::new(
            execution_id,
            node_id.clone(),
            executor.events.create_emitter(execution_id, node_id.clone()),
        );
        node_ctx.attempt = attempt;
        node_ctx.items = items;
        node_ctx.cancellation = token.clone();
        node_ctx.deadline = Some(started + timeout);

        let registry = executor.registry.clone();
        let node_type = spec.node_type.clone();
        let call_input = input.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = registry.invoke(&node_type, call_input, node_ctx) => result,
                _ = tokio::time::sleep(timeout) => {
                    token.cancel();
                    Err(NodeError::Timeout { timeout_ms })
                }
                _ = token.cancelled() => Err(NodeError::Cancelled),
            }
        });

        self.running.push(Box::pin(async move {
            let outcome = match task.await {
                Ok(result) => result.map_err(|e| ErrorInfo::from(&e).at_node(&node_id)),
                Err(e) => Err(ErrorInfo::new(
                    ErrorKind::NodeHandler,
                    format!("node task panicked: {e}"),
                )
                .at_node(&node_id)),
            };
            Completion::Attempt {
                node_id,
                attempt,
                input: Some(input),
                outcome,
                started,
            }
        }));
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Attempt {
                node_id,
                attempt,
                input,
                outcome,
                started,
            } => {
                self.in_flight -= 1;
                match outcome {
                    Ok(output) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        self.on_success(node_id, attempt, input, output, duration_ms)
                    }
                    Err(error) => self.on_failure(node_id, attempt, input, error),
                }
            }
            Completion::RetryDue { node_id } => {
                if !self.retrying.remove(&node_id) {
                    return;
                }
                if self.stopped() {
                    self.discard_ready(&node_id);
                } else {
                    self.pending.push_back(node_id);
                }
            }
        }
    }

    fn on_success(
        &mut self,
        node_id: NodeId,
        attempt: u32,
        input: Option<Value>,
        output: NodeOutput,
        duration_ms: u64,
    ) {
        let execution_id = self.execution.id;
        let branch = output.branch;
        let Some(record) = self.execution.latest_mut(&node_id) else {
            return;
        };
        record.succeed(input.unwrap_or_default(), output.data, branch);
        self.executor.hooks.on_node_complete(execution_id, record);

        tracing::info!(
            execution_id = %execution_id,
            node_id = %node_id,
            attempt,
            duration_ms,
            "Node completed"
        );
        self.executor.events.emit(ExecutionEvent::NodeCompleted {
            execution_id,
            node_id: node_id.clone(),
            attempt,
            branch,
            duration_ms,
            timestamp: Utc::now(),
        });
        self.mark_completed(node_id);
    }

    fn on_failure(&mut self, node_id: NodeId, attempt: u32, input: Option<Value>, error: ErrorInfo) {
        let executor = self.executor;
        let execution_id = self.execution.id;
        let spec = executor.workflow.find_node(&node_id);
        let max_attempts = spec.map_or(1, |s| s.max_attempts());
        let will_retry =
            error.kind != ErrorKind::Cancelled && attempt < max_attempts && !self.stopped();

        let Some(record) = self.execution.latest_mut(&node_id) else {
            return;
        };
        record.fail(input, error.clone());
        executor.hooks.on_node_error(execution_id, record, will_retry);

        tracing::warn!(
            execution_id = %execution_id,
            node_id = %node_id,
            attempt,
            will_retry,
            "Node failed: {}",
            error.message
        );
        executor.events.emit(ExecutionEvent::NodeFailed {
            execution_id,
            node_id: node_id.clone(),
            attempt,
            error: error.clone(),
            will_retry,
            timestamp: Utc::now(),
        });

        if will_retry {
            let delay = spec
                .and_then(|s| s.retry_policy.as_ref())
                .map(|p| p.delay_after(attempt))
                .unwrap_or_default();
            self.execution
                .push_record(NodeExecution::ready(node_id.clone(), attempt + 1));
            self.retrying.insert(node_id.clone());
            let stop = self.retry_stop.clone();
            self.running.push(Box::pin(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.cancelled() => {}
                }
                Completion::RetryDue { node_id }
            }));
            return;
        }

        if executor.cancel.is_cancelled() {
            self.mark_completed(node_id);
            return;
        }
        if self.queue.has_error_edge(&node_id) {
            tracing::info!(
                execution_id = %execution_id,
                node_id = %node_id,
                "Routing failure to error edge"
            );
            self.mark_completed(node_id);
            return;
        }

        // Error and halt go into the checkpoint below.
        if self.execution.error.is_none() {
            self.execution.error = Some(error);
        }
        if executor.workflow.settings.on_error == FailurePolicy::FailFast && !self.halted {
            tracing::warn!(
                execution_id = %execution_id,
                node_id = %node_id,
                "Halting execution after unhandled node failure"
            );
            self.halt();
        }
        self.mark_completed(node_id);
    }

    fn halt(&mut self) {
        self.halted = true;
        self.retry_stop.cancel();
        self.drop_pending();
    }

    fn mark_completed(&mut self, node_id: NodeId) {
        self.completed.insert(node_id);
        self.checkpoint();
    }

    fn checkpoint(&mut self) {
        let Some(writer) = &self.writer else {
            return;
        };
        self.sequence += 1;
        writer.submit(Checkpoint::capture(
            &self.execution,
            &self.completed,
            self.sequence,
        ));
        self.execution.checkpoint = Some(self.sequence);
    }

    /// Forget nodes that were scheduled but will never be dispatched.
    fn drop_pending(&mut self) {
        let pending: Vec<NodeId> = self.pending.drain(..).collect();
        let retrying: Vec<NodeId> = self.retrying.drain().collect();
        for node_id in pending.iter().chain(&retrying) {
            self.discard_ready(node_id);
        }
    }

    fn discard_ready(&mut self, node_id: &str) {
        let Some(attempts) = self.execution.results.get_mut(node_id) else {
            return;
        };
        if attempts
            .last()
            .is_some_and(|r| r.status == NodeStatus::Ready)
        {
            attempts.pop();
        }
        if attempts.is_empty() {
            self.execution.results.remove(node_id);
        }
    }

    /// Wait for every submitted checkpoint. On failure `execution.checkpoint`
    /// falls back to the last sequence actually stored.
    async fn close_writer(&mut self) -> Result<(), CheckpointError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let flushed = writer.flush().await;
        let durable = writer.last_saved();
        let result = flushed.and(writer.close().await);
        if result.is_err() {
            self.execution.checkpoint = durable.or(self.restored_from);
        }
        result
    }

    async fn finish(mut self, timed_out: bool, clock: Instant) -> Execution {
        self.drop_pending();
        let executor = self.executor;
        let execution_id = self.execution.id;

        let status = if timed_out {
            let limit = executor.workflow.settings.max_execution_time_ms.unwrap_or_default();
            self.execution.error = Some(ErrorInfo::new(
                ErrorKind::Timeout,
                format!("execution exceeded its time limit of {limit}ms"),
            ));
            ExecutionStatus::TimedOut
        } else if executor.cancel.is_cancelled() {
            self.execution.error = Some(ErrorInfo::new(
                ErrorKind::Cancelled,
                "execution was cancelled",
            ));
            ExecutionStatus::Cancelled
        } else if self.execution.error.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        self.execution.status = status;
        self.execution.finished_at = Some(Utc::now());

        self.checkpoint();
        let status = match self.close_writer().await {
            Ok(()) => status,
            Err(e) => {
                tracing::error!(
                    execution_id = %execution_id,
                    durable = ?self.execution.checkpoint,
                    "Failed to persist checkpoints: {}",
                    e
                );
                if self.execution.error.is_none() {
                    self.execution.error = Some(ErrorInfo::new(
                        ErrorKind::Checkpoint,
                        format!("checkpoint could not be saved: {e}"),
                    ));
                }
                if status == ExecutionStatus::Completed {
                    self.execution.status = ExecutionStatus::Failed;
                }
                self.execution.status
            }
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        tracing::info!(
            execution_id = %execution_id,
            status = ?status,
            duration_ms,
            "Workflow execution finished"
        );
        executor.events.emit(ExecutionEvent::ExecutionFinished {
            execution_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        self.execution
    }
}
