//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for run, history and task persistence
//! - [`InMemoryWorkflowEventStore`] backing the in-process engine

mod memory;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    ClaimedTask, NewRun, ParentLink, StoreError, TaskDefinition, TaskFailureOutcome, TaskStatus,
    WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
