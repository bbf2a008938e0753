//! Invocation options shared by every workflow in the catalog

use std::time::Duration;

use flowline_durable::reliability::RetryPolicy;
use flowline_durable::workflow::{ActivityOptions, ChildWorkflowOptions, WorkflowAction};
use serde_json::Value;

/// Queue the catalog's runs and activities are served from
pub const TASK_QUEUE: &str = "hello-world-queue";

pub const ACTIVITY_START_TO_CLOSE: Duration = Duration::from_secs(30);

pub const CHILD_RUN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 1s, 2s, ... capped at 60s; three attempts in total
pub fn activity_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential()
        .with_initial_interval(Duration::from_secs(1))
        .with_backoff_coefficient(2.0)
        .with_max_interval(Duration::from_secs(60))
        .with_max_attempts(3)
        .with_jitter(0.0)
}

pub fn activity_options() -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(activity_retry_policy())
        .with_start_to_close_timeout(ACTIVITY_START_TO_CLOSE)
}

pub fn child_options() -> ChildWorkflowOptions {
    ChildWorkflowOptions::default()
        .with_retry(RetryPolicy::exponential().with_max_attempts(3))
        .with_run_timeout(CHILD_RUN_TIMEOUT)
}

/// Schedule an activity with the shared options
pub(crate) fn call_activity(
    activity_id: impl Into<String>,
    activity_type: &str,
    input: Value,
) -> WorkflowAction {
    WorkflowAction::schedule_activity_with(activity_id, activity_type, input, activity_options())
}
