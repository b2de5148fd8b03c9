use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::executor::{ExecutionHooks, WorkflowExecutor};
use crate::registry::NodeRegistry;
use chrono::Utc;
use flowcore::{
    Checkpoint, ErrorInfo, ErrorKind, EventBus, Execution, ExecutionEvent, ExecutionId,
    ExecutionStatus, ExpressionEngine, ExpressionLimits, FlowError, Map, ValidationConfig,
    Validator, Value, Workflow, WorkflowError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn CheckpointStore>,
    config: RuntimeConfig,
    event_bus: EventBus,
    expressions: ExpressionEngine,
    slots: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<ExecutionId, CancellationToken>>>,
}

impl FlowRuntime {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<dyn CheckpointStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            store,
            event_bus: EventBus::new(config.event_buffer_size),
            expressions: ExpressionEngine::new(config.expression_limits.clone()),
            slots: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Runtime with default settings and checkpoints kept in memory
    pub fn in_memory(registry: Arc<NodeRegistry>) -> Self {
        Self::new(
            registry,
            Arc::new(InMemoryCheckpointStore::new()),
            RuntimeConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Check a workflow against the registered node types.
    pub fn validate(&self, workflow: &Workflow) -> Result<(), FlowError> {
        Validator::new(ValidationConfig {
            max_nodes: self.config.max_nodes,
        })
        .with_catalog(self.registry.as_ref())
        .with_expression_engine(self.expressions.clone())
        .validate(workflow)?;
        Ok(())
    }

    /// Validate and run a workflow to completion.
    ///
    /// A workflow that fails validation is rejected with
    /// [`FlowError::Validation`] before any execution is created.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        payload: Value,
        options: ExecutionOptions,
    ) -> Result<Execution, FlowError> {
        self.start(workflow, payload, options)?.wait().await
    }

    /// Validate a workflow and start running it in the background.
    pub fn start(
        &self,
        workflow: &Workflow,
        payload: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, FlowError> {
        self.validate(workflow)?;
        let execution = Execution::new(workflow.id, payload);
        tracing::debug!(
            execution_id = %execution.id,
            workflow = %workflow.name,
            "Queued workflow execution"
        );
        Ok(self.launch(Arc::new(workflow.clone()), execution, options, None))
    }

    /// Continue an execution from its latest checkpoint.
    ///
    /// Only one resume per execution can be in progress; the lease is held
    /// until the resumed run finishes.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        execution_id: ExecutionId,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, FlowError> {
        self.validate(workflow)?;

        let owner = Uuid::new_v4();
        if !self.store.acquire_lease(execution_id, owner).await? {
            return Err(WorkflowError::LeaseUnavailable(execution_id).into());
        }

        match self.restore(workflow, execution_id).await {
            Ok(execution) => Ok(self.launch(
                Arc::new(workflow.clone()),
                execution,
                options,
                Some(owner),
            )),
            Err(e) => {
                if let Err(release) = self.store.release_lease(execution_id, owner).await {
                    tracing::warn!(
                        execution_id = %execution_id,
                        "Failed to release recovery lease: {}",
                        release
                    );
                }
                Err(e)
            }
        }
    }

    async fn restore(
        &self,
        workflow: &Workflow,
        execution_id: ExecutionId,
    ) -> Result<Execution, FlowError> {
        let checkpoint = self
            .store
            .load_latest(execution_id)
            .await?
            .ok_or(WorkflowError::CheckpointNotFound(execution_id))?;

        if checkpoint.workflow_id != workflow.id {
            return Err(WorkflowError::WorkflowMismatch {
                execution_id,
                found: checkpoint.workflow_id,
            }
            .into());
        }
        if checkpoint.status.is_terminal() {
            return Err(WorkflowError::AlreadyFinished(execution_id).into());
        }

        let mut execution = checkpoint.restore();
        let sequence = checkpoint.sequence + 1;

        if checkpoint.recovery_attempts >= self.config.max_recovery_attempts {
            let attempts = checkpoint.recovery_attempts;
            tracing::error!(
                execution_id = %execution_id,
                attempts,
                "Recovery attempts exhausted, marking execution failed"
            );
            execution.status = ExecutionStatus::Failed;
            execution.finished_at = Some(Utc::now());
            execution.error = Some(ErrorInfo::new(
                ErrorKind::RecoveryExhausted,
                format!("gave up after {attempts} recovery attempts"),
            ));
            self.store
                .save(&Checkpoint::capture(
                    &execution,
                    &checkpoint.completed_node_ids,
                    sequence,
                ))
                .await?;
            return Err(FlowError::RecoveryExhausted {
                execution_id,
                attempts,
            });
        }

        execution.recovery_attempts += 1;
        self.store
            .save(&Checkpoint::capture(
                &execution,
                &checkpoint.completed_node_ids,
                sequence,
            ))
            .await?;
        execution.checkpoint = Some(sequence);

        tracing::info!(
            execution_id = %execution_id,
            sequence,
            completed = checkpoint.completed_node_ids.len(),
            recovery_attempt = execution.recovery_attempts,
            "Resuming execution from checkpoint"
        );
        Ok(execution)
    }

    fn launch(
        &self,
        workflow: Arc<Workflow>,
        execution: Execution,
        options: ExecutionOptions,
        lease: Option<Uuid>,
    ) -> ExecutionHandle {
        let execution_id = execution.id;
        let cancel = CancellationToken::new();

        let mut executor =
            WorkflowExecutor::new(workflow, self.registry.clone(), self.event_bus.clone())
                .with_expression_engine(self.expressions.clone())
                .with_env(self.env_for(&options))
                .with_cancellation(cancel.clone())
                .with_max_parallel(options.max_parallel.unwrap_or(self.config.max_parallel_nodes))
                .with_default_timeout_ms(self.config.default_node_timeout_ms);
        if let Some(hooks) = options.hooks {
            executor = executor.with_hooks(hooks);
        }
        if options.checkpointing {
            executor = executor.with_checkpoint_store(self.store.clone());
        }

        lock(&self.active).insert(execution_id, cancel.clone());

        let slots = self.slots.clone();
        let active = self.active.clone();
        let store = self.store.clone();
        let renew_every = Duration::from_millis(self.config.lease_renew_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let run = async {
                match slots.acquire_owned().await {
                    Ok(_permit) => executor.run(execution).await,
                    Err(_) => Err(FlowError::Execution("runtime is shutting down".to_string())),
                }
            };
            let result = match lease {
                Some(owner) => {
                    holding_lease(run, store.as_ref(), execution_id, owner, renew_every).await
                }
                None => run.await,
            };

            lock(&active).remove(&execution_id);
            if let Some(owner) = lease {
                if let Err(e) = store.release_lease(execution_id, owner).await {
                    tracing::warn!(
                        execution_id = %execution_id,
                        "Failed to release recovery lease: {}",
                        e
                    );
                }
            }
            result
        });

        ExecutionHandle {
            execution_id,
            cancel,
            task,
        }
    }

    /// `$env`: allowlisted process variables, overridden by the caller's map.
    fn env_for(&self, options: &ExecutionOptions) -> Map<String, Value> {
        let mut env = Map::new();
        for name in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), Value::String(value));
            }
        }
        env.extend(options.env.clone());
        env
    }

    /// Cancel a running execution. Returns false if it is not running here.
    pub fn cancel(&self, execution_id: ExecutionId) -> bool {
        match lock(&self.active).get(&execution_id) {
            Some(token) => {
                tracing::info!(execution_id = %execution_id, "Cancelling execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_executions(&self) -> Vec<ExecutionId> {
        lock(&self.active).keys().copied().collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running execution.
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    cancel: CancellationToken,
    task: JoinHandle<Result<Execution, FlowError>>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Stop dispatching and signal running handlers to abort.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the execution to reach a terminal state.
    pub async fn wait(self) -> Result<Execution, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("execution task failed: {e}")))?
    }
}

/// Per-call execution options
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Overrides `RuntimeConfig::max_parallel_nodes`
    pub max_parallel: Option<usize>,
    /// Write checkpoints so the execution can be resumed
    pub checkpointing: bool,
    /// Extra `$env` values
    pub env: Map<String, Value>,
    pub hooks: Option<Arc<dyn ExecutionHooks>>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_parallel: None,
            checkpointing: true,
            env: Map::new(),
            hooks: None,
        }
    }
}

impl ExecutionOptions {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn without_checkpointing(mut self) -> Self {
        self.checkpointing = false;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ExecutionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

/// Drive `run` while renewing the recovery lease every `every`.
async fn holding_lease<F: Future>(
    run: F,
    store: &dyn CheckpointStore,
    execution_id: ExecutionId,
    owner: Uuid,
    every: Duration,
) -> F::Output {
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            output = &mut run => return output,
            _ = ticker.tick() => match store.renew_lease(execution_id, owner).await {
                Ok(true) => tracing::trace!(execution_id = %execution_id, "Renewed recovery lease"),
                Ok(false) => tracing::warn!(
                    execution_id = %execution_id,
                    "Recovery lease is held by another owner"
                ),
                Err(e) => tracing::warn!(
                    execution_id = %execution_id,
                    "Failed to renew recovery lease: {}",
                    e
                ),
            },
        }
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub max_concurrent_executions: usize,
    pub event_buffer_size: usize,
    pub default_node_timeout_ms: u64,
    pub max_recovery_attempts: u32,
    /// How often a resumed execution refreshes its recovery lease
    pub lease_renew_interval_ms: u64,
    pub max_nodes: usize,
    pub expression_limits: ExpressionLimits,
    /// Process environment variables exposed as `$env`
    pub env_allowlist: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            max_concurrent_executions: 32,
            event_buffer_size: 1000,
            default_node_timeout_ms: 300_000,
            max_recovery_attempts: 3,
            lease_renew_interval_ms: 10_000,
            max_nodes: 500,
            expression_limits: ExpressionLimits::default(),
            env_allowlist: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_keys() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"max_parallel_nodes": 2, "env_allowlist": ["HOME"]}"#)
                .unwrap();
        assert_eq!(config.max_parallel_nodes, 2);
        assert_eq!(config.max_recovery_attempts, 3);
        assert_eq!(config.lease_renew_interval_ms, 10_000);
        assert_eq!(config.expression_limits.max_steps, 100_000);
        assert_eq!(config.env_allowlist, vec!["HOME"]);
    }

    #[test]
    fn caller_env_overrides_allowlist() {
        std::env::set_var("FLOWRUNTIME_TEST_REGION", "eu");
        let runtime = FlowRuntime::new(
            Arc::new(NodeRegistry::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            RuntimeConfig {
                env_allowlist: vec!["FLOWRUNTIME_TEST_REGION".into(), "FLOWRUNTIME_UNSET".into()],
                ..RuntimeConfig::default()
            },
        );

        let env = runtime.env_for(&ExecutionOptions::default());
        assert_eq!(env["FLOWRUNTIME_TEST_REGION"], "eu");
        assert!(!env.contains_key("FLOWRUNTIME_UNSET"));

        let env = runtime.env_for(&ExecutionOptions::default().with_env("FLOWRUNTIME_TEST_REGION", "us"));
        assert_eq!(env["FLOWRUNTIME_TEST_REGION"], "us");
    }
}
