//! # Flowline workflow catalog
//!
//! Durable business processes built from four idempotent activities:
//!
//! | Workflow | Shape |
//! |---|---|
//! | `WorkflowC` ([`PipelineWorkflow`]) | Activity1 -> Activity2 |
//! | `WorkflowA` ([`DelegationWorkflow`]) | Activity1 -> Activity2 -> child `WorkflowB` -> Activity3 |
//! | `WorkflowB` ([`DelegateChildWorkflow`]) | Activity4 |
//! | `WorkflowD` ([`FanOutWorkflow`]) | {Activity1, Activity2, Activity4} joined -> Activity3 |
//!
//! Workflows only see the engine contract from `flowline-durable`. Every
//! activity call carries the shared options in [`options`].
//!
//! ## Example
//!
//! ```ignore
//! use flowline_durable::LocalEngine;
//! use flowline_workflows::{register_catalog, ActivityLatency, TASK_QUEUE};
//!
//! let engine = register_catalog(
//!     LocalEngine::builder().with_task_queue(TASK_QUEUE),
//!     ActivityLatency::standard(),
//! )
//! .build();
//! engine.start()?;
//! ```

pub mod activities;
pub mod delegation;
pub mod fan_out;
pub mod options;
pub mod payload;
pub mod pipeline;

use flowline_durable::workflow::Workflow;
use flowline_durable::LocalEngineBuilder;

pub use activities::{ActivityLatency, ChildTransform, EnrichData, FinalizeRun, ReceiveInput};
pub use delegation::{child_workflow_id, DelegateChildWorkflow, DelegationWorkflow};
pub use fan_out::FanOutWorkflow;
pub use options::TASK_QUEUE;
pub use payload::{Payload, PayloadError};
pub use pipeline::PipelineWorkflow;

/// Public names of every workflow in the catalog
pub const WORKFLOW_TYPES: [&str; 4] = [
    DelegationWorkflow::TYPE,
    DelegateChildWorkflow::TYPE,
    PipelineWorkflow::TYPE,
    FanOutWorkflow::TYPE,
];

/// Register every workflow and activity of the catalog
pub fn register_catalog(builder: LocalEngineBuilder, latency: ActivityLatency) -> LocalEngineBuilder {
    builder
        .register_workflow::<DelegationWorkflow>()
        .register_workflow::<DelegateChildWorkflow>()
        .register_workflow::<PipelineWorkflow>()
        .register_workflow::<FanOutWorkflow>()
        .register_activity(ReceiveInput::new(latency))
        .register_activity(EnrichData::new(latency))
        .register_activity(FinalizeRun::new(latency))
        .register_activity(ChildTransform::new(latency))
}
