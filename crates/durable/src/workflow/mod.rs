//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowContext`] for replay-safe run identity and time
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] enum for persisted events
//! - [`WorkflowSignal`] for external communication
//! - [`BranchSet`] for fan-out/fan-in joins

mod action;
mod definition;
mod event;
mod join;
mod signal;

pub use action::{ActivityOptions, ChildWorkflowOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowContext, WorkflowError};
pub use event::{HistoryEvent, WorkflowEvent};
pub use join::{Branch, BranchOutcome, BranchSet, JoinPolicy};
pub use signal::{signal_types, WorkflowSignal};
