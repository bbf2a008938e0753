//! Workflow trait definition

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::{WorkflowAction, WorkflowSignal};
use crate::activity::{ActivityError, FailureKind};

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Failure class
    #[serde(default)]
    pub kind: FailureKind,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether a fresh run of the same workflow may succeed
    ///
    /// Consulted by the child workflow retry policy.
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new terminal workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Terminal,
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Transient,
            code: None,
            retryable: true,
        }
    }

    /// The run or a join budget ran out of time
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Timeout,
            code: Some(crate::activity::error_types::TIMEOUT.to_string()),
            retryable: true,
        }
    }

    /// The run was cancelled
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Cancelled,
            code: Some(crate::activity::error_types::CANCELLED.to_string()),
            retryable: false,
        }
    }

    /// Surface a final activity failure, naming the activity
    ///
    /// The reason and failure class are kept as they are.
    pub fn from_activity(activity_type: &str, error: &ActivityError) -> Self {
        Self {
            message: format!("{} failed: {}", activity_type, error.message),
            kind: error.kind,
            code: error.error_type.clone(),
            retryable: error.retryable && error.kind != FailureKind::Cancelled,
        }
    }

    /// Surface a child workflow failure, naming the child
    pub fn from_child(child_workflow_id: &str, error: &WorkflowError) -> Self {
        Self {
            message: format!("child workflow {} failed: {}", child_workflow_id, error.message),
            kind: error.kind,
            code: error.code.clone(),
            retryable: error.retryable,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Replay-safe view of the run a handler is executing in
///
/// `now()` is the time the engine recorded for the event being handled, so
/// it is the same value on first execution and on every replay.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: Uuid,
    workflow_type: String,
    now: DateTime<Utc>,
    replaying: bool,
}

impl WorkflowContext {
    /// Create a context for a handler invocation
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: Uuid,
        workflow_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
            workflow_type: workflow_type.into(),
            now,
            replaying: false,
        }
    }

    /// Mark the context as replaying recorded history
    pub fn replaying(mut self, replaying: bool) -> Self {
        self.replaying = replaying;
        self
    }

    /// Same run, different logical time
    pub(crate) fn at(&self, now: DateTime<Utc>, replaying: bool) -> Self {
        Self {
            now,
            replaying,
            ..self.clone()
        }
    }

    /// Business identifier of the run
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Engine-assigned run identifier
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Registered workflow type
    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    /// Logical, deterministic timestamp
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True while the engine rebuilds state from history
    ///
    /// Use it to keep logs and other side channels quiet during replay.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }
}

/// A workflow is a deterministic state machine driven by events
///
/// Workflows are the core abstraction for durable execution. They define:
/// - How to start execution (`on_start`)
/// - How to handle activity outcomes (`on_activity_completed`, `on_activity_failed`)
/// - How to handle child workflow outcomes
/// - How to handle timers (`on_timer_fired`)
/// - How to handle external signals (`on_signal`)
///
/// # Determinism
///
/// Workflows must be deterministic - given the same sequence of events, they must
/// produce the same sequence of actions. Time comes from [`WorkflowContext::now`],
/// never from the system clock. The engine checks this during replay.
///
/// # Example
///
/// ```ignore
/// use flowline_durable::prelude::*;
///
/// struct OrderWorkflow {
///     state: OrderState,
///     order: Value,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = Value;
///
///     fn new(input: Self::Input) -> Self {
///         Self { state: OrderState::Created, order: input }
///     }
///
///     fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_activity("1-validate", "validate_order", self.order.clone())]
///     }
///
///     // ... implement other methods
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Create a new workflow instance from input
    ///
    /// This is called both when starting a new workflow and when replaying.
    fn new(input: Self::Input) -> Self;

    /// Called when workflow starts (or replays from beginning)
    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction>;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when an activity fails (after all retries exhausted)
    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    /// Called when a child workflow completes successfully
    fn on_child_workflow_completed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, workflow_id, result);
        vec![]
    }

    /// Called when a child workflow fails (after its own retries)
    ///
    /// Fails the parent unless the workflow overrides this.
    fn on_child_workflow_failed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        error: &WorkflowError,
    ) -> Vec<WorkflowAction> {
        let _ = ctx;
        vec![WorkflowAction::fail(WorkflowError::from_child(
            workflow_id,
            error,
        ))]
    }

    /// Called when a timer fires
    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called when an external signal is received
    ///
    /// A cancel signal cancels the run unless the workflow overrides this.
    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let _ = ctx;
        if signal.is_cancel() {
            vec![WorkflowAction::cancel(signal.reason())]
        } else {
            vec![]
        }
    }

    /// Check if workflow has reached a terminal state
    fn is_completed(&self) -> bool;
}
