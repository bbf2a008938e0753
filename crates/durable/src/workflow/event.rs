//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, ChildWorkflowOptions, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Events in a run's history
///
/// These events form the append-only log for a run. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows after recovery
/// - Auditing and debugging
///
/// Events are immutable once written. The workflow state is reconstructed
/// by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Unique activity identifier within the run
        activity_id: String,

        /// Type of activity to execute
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// Activity completed successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Result returned by the activity
        result: serde_json::Value,

        /// Attempt that produced the result (1-based)
        attempt: u32,
    },

    /// Activity attempt failed
    ///
    /// With `will_retry` set the entry is informational and never reaches
    /// workflow code.
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Error details
        error: ActivityError,

        /// Attempt that failed (1-based)
        attempt: u32,

        /// Whether the activity will be retried
        will_retry: bool,
    },

    /// Activity was cancelled
    ActivityCancelled {
        /// Activity identifier
        activity_id: String,

        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Timer was started
    TimerStarted {
        /// Timer identifier
        timer_id: String,

        /// Duration in milliseconds
        duration_ms: u64,
    },

    /// Timer fired (duration elapsed)
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    /// Timer was cancelled
    TimerCancelled {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// External signal was received
    SignalReceived {
        /// The signal that was received
        signal: WorkflowSignal,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Child workflow was started
    ChildWorkflowStarted {
        /// Child business identifier
        workflow_id: String,

        /// Run id of the first child run
        run_id: Uuid,

        /// Type of the child workflow
        workflow_type: String,

        /// Options the child was started with
        options: ChildWorkflowOptions,
    },

    /// A failed child run was replaced by a fresh run under the same id
    ChildWorkflowRetried {
        /// Child business identifier
        workflow_id: String,

        /// Run id of the new child run
        run_id: Uuid,

        /// Child attempt number (1-based)
        attempt: u32,

        /// Failure of the previous run
        error: WorkflowError,
    },

    /// Child workflow completed successfully
    ChildWorkflowCompleted {
        /// Child business identifier
        workflow_id: String,

        /// Result from the child workflow
        result: serde_json::Value,
    },

    /// Child workflow failed
    ChildWorkflowFailed {
        /// Child business identifier
        workflow_id: String,

        /// Error from the child workflow
        error: WorkflowError,
    },
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. }
            | Self::ActivityCancelled { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Get the child workflow id if this is a child-related event
    pub fn child_workflow_id(&self) -> Option<&str> {
        match self {
            Self::ChildWorkflowStarted { workflow_id, .. }
            | Self::ChildWorkflowRetried { workflow_id, .. }
            | Self::ChildWorkflowCompleted { workflow_id, .. }
            | Self::ChildWorkflowFailed { workflow_id, .. } => Some(workflow_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// Whether this event resolves an activity for the workflow
    ///
    /// Completion, final failure and cancellation all do; a failed attempt
    /// that will be retried does not.
    pub fn closes_activity(&self) -> bool {
        matches!(
            self,
            Self::ActivityCompleted { .. }
                | Self::ActivityFailed {
                    will_retry: false,
                    ..
                }
                | Self::ActivityCancelled { .. }
        )
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::ActivityCancelled { .. } => "activity_cancelled",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::SignalReceived { .. } => "signal_received",
            Self::ChildWorkflowStarted { .. } => "child_workflow_started",
            Self::ChildWorkflowRetried { .. } => "child_workflow_retried",
            Self::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            Self::ChildWorkflowFailed { .. } => "child_workflow_failed",
        }
    }
}

/// A history entry as stored: the event plus its position and record time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Zero-based position in the run's history
    pub sequence: u64,

    /// When the engine recorded the event; the workflow's logical clock
    pub recorded_at: DateTime<Utc>,

    /// The event itself
    pub event: WorkflowEvent,
}
