//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which drives workflow
//! state machines through event replay and action processing, the
//! caller-facing [`WorkflowClient`] contract, and [`LocalEngine`] which runs
//! executor and worker pool in one process.

mod client;
mod executor;
mod local;
mod registry;
mod replay;

pub use client::{RunDescription, RunHandle, StartWorkflowRequest, WorkflowClient};
pub use executor::{ExecutorConfig, ExecutorError, WorkflowExecutor};
pub use local::{LocalEngine, LocalEngineBuilder};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
