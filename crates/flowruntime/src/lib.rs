//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the node registry,
//! the dependency-aware ready queue, the scheduling loop with retries and
//! error-edge routing, and checkpoint-based recovery.

mod checkpoint;
mod executor;
mod queue;
mod registry;
mod runtime;

pub use checkpoint::{CheckpointStore, CheckpointWriter, FileCheckpointStore, InMemoryCheckpointStore};
pub use executor::{ExecutionHooks, NoHooks, WorkflowExecutor};
pub use queue::{ExecutionQueue, ReadyBatch};
pub use registry::NodeRegistry;
pub use runtime::{ExecutionHandle, ExecutionOptions, FlowRuntime, RuntimeConfig};
