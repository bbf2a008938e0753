//! Workflow actions and invocation options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::{duration_millis, option_duration_millis, RetryPolicy};

/// Actions a workflow can request
///
/// These are the commands a workflow can issue in response to events.
/// Each action is recorded as a [`WorkflowEvent`](super::WorkflowEvent) before
/// the engine acts on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the run
        activity_id: String,

        /// Type of activity to execute (routes the task to a worker handler)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts, queue)
        options: ActivityOptions,
    },

    /// Start a child workflow and wait for its terminal outcome
    ScheduleChildWorkflow {
        /// Business identifier for the child; must be deterministic
        workflow_id: String,

        /// Type of workflow to start
        workflow_type: String,

        /// Input for the child workflow
        input: serde_json::Value,

        /// Retry policy and run timeout for the child
        options: ChildWorkflowOptions,
    },

    /// Start a timer that fires after the specified duration
    StartTimer {
        /// Unique identifier for this timer within the run
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Cancel a timer that has not fired yet
    CancelTimer {
        /// ID of the timer to cancel
        timer_id: String,
    },

    /// Request cancellation of a pending activity
    CancelActivity {
        /// ID of the activity to cancel
        activity_id: String,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// Close the run as cancelled, cancelling everything it still owns
    CancelWorkflow {
        /// Reason for cancellation
        reason: String,
    },
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::schedule_activity_with(activity_id, activity_type, input, ActivityOptions::default())
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a child workflow action
    pub fn child_workflow(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
        options: ChildWorkflowOptions,
    ) -> Self {
        Self::ScheduleChildWorkflow {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            input,
            options,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Create a cancel workflow action
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::CancelWorkflow {
            reason: reason.into(),
        }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Whether this action closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow { .. }
        )
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Maximum time for one attempt (from start to completion)
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// Task queue to dispatch on; defaults to the run's queue
    #[serde(default)]
    pub task_queue: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
            task_queue: None,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Dispatch on a specific task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

/// Options for child workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildWorkflowOptions {
    /// Retry policy applied to whole child runs
    pub retry_policy: RetryPolicy,

    /// Maximum duration of a single child run
    #[serde(with = "option_duration_millis")]
    pub run_timeout: Option<Duration>,

    /// Task queue for the child; defaults to the parent's queue
    #[serde(default)]
    pub task_queue: Option<String>,
}

impl Default for ChildWorkflowOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::no_retry(),
            run_timeout: None,
            task_queue: None,
        }
    }
}

impl ChildWorkflowOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Bound each child run
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Run the child on a specific task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_activity_action() {
        let action =
            WorkflowAction::schedule_activity("step-1", "my_activity", json!({"key": "value"}));

        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                input,
                ..
            } => {
                assert_eq!(activity_id, "step-1");
                assert_eq!(activity_type, "my_activity");
                assert_eq!(input, json!({"key": "value"}));
            }
            _ => panic!("Expected ScheduleActivity"),
        }
    }

    #[test]
    fn test_activity_options_serialization() {
        let options = ActivityOptions::default()
            .with_start_to_close_timeout(Duration::from_secs(30))
            .with_task_queue("q");

        let json = serde_json::to_string(&options).unwrap();
        let parsed: ActivityOptions = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.start_to_close_timeout, Duration::from_secs(30));
        assert_eq!(parsed.task_queue.as_deref(), Some("q"));
    }

    #[test]
    fn test_workflow_action_serialization() {
        let action = WorkflowAction::child_workflow(
            "child-1",
            "Child",
            json!({}),
            ChildWorkflowOptions::default().with_run_timeout(Duration::from_secs(300)),
        );

        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"schedule_child_workflow\""));

        let parsed: WorkflowAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, parsed);
    }

    #[test]
    fn test_terminal_actions() {
        assert!(WorkflowAction::complete(json!({})).is_terminal());
        assert!(WorkflowAction::fail(WorkflowError::new("x")).is_terminal());
        assert!(WorkflowAction::cancel("stop").is_terminal());
        assert!(!WorkflowAction::timer("t", Duration::from_secs(1)).is_terminal());
    }
}
