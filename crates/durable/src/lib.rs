//! # Durable Execution Engine
//!
//! The workflow/activity contract and an in-process engine that runs it.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every state change is a history event; workflows are rebuilt by replay
//! - **Determinism checks**: replay compares recorded commands with the ones workflow code produces
//! - **Automatic retries**: configurable retry policies with exponential backoff and jitter
//! - **Child workflows**: independently identified runs, retried as a whole under their own policy
//! - **Timers and timeouts**: logical timers, per-activity start-to-close and per-run timeouts
//! - **Cancellation**: reaches outstanding activities, timers and child runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (drives workflow state machines, handles event replay)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (runs, append-only histories, activity task queue)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (claims tasks, executes activities, reports outcomes)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowline_durable::prelude::*;
//!
//! struct GreetWorkflow {
//!     name: String,
//!     done: bool,
//! }
//!
//! impl Workflow for GreetWorkflow {
//!     const TYPE: &'static str = "greet";
//!     type Input = String;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { name: input, done: false }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_activity("1-greet", "say_hello", json!(self.name))]
//!     }
//!
//!     // ... implement other trait methods
//! }
//!
//! let engine = LocalEngine::builder()
//!     .register_workflow::<GreetWorkflow>()
//!     .register_activity(SayHello)
//!     .build();
//! engine.start()?;
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{error_types, Activity, ActivityContext, ActivityError, FailureKind};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, LocalEngine, LocalEngineBuilder, RunDescription, RunHandle,
        StartWorkflowRequest, WorkflowClient, WorkflowExecutor, WorkflowRegistry,
    };
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, BranchSet, ChildWorkflowOptions, JoinPolicy, Workflow, WorkflowAction,
        WorkflowContext, WorkflowError, WorkflowEvent, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, FailureKind};
pub use engine::{
    ExecutorConfig, ExecutorError, LocalEngine, LocalEngineBuilder, RunDescription, RunHandle,
    StartWorkflowRequest, WorkflowClient, WorkflowExecutor, WorkflowRegistry,
};
pub use persistence::{InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowStatus};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, ChildWorkflowOptions, Workflow, WorkflowAction, WorkflowContext,
    WorkflowError, WorkflowEvent, WorkflowSignal,
};
