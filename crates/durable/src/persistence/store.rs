//! WorkflowEventStore trait definition

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent};

/// Errors from store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// No run has ever been started under this workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// A run with this workflow id is still running
    #[error("workflow {workflow_id} is already running (run {run_id})")]
    AlreadyStarted { workflow_id: String, run_id: Uuid },

    /// Optimistic concurrency conflict
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// The run already reached a terminal state
    #[error("run {0} is closed")]
    RunClosed(Uuid),
}

/// Workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Run is in progress
    Running,

    /// Run completed successfully
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the run can no longer change
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly not before a backoff deadline)
    Pending,
    /// Claimed by a worker
    Claimed,
    /// Completed successfully
    Completed,
    /// Failed for good
    Failed,
    /// Cancelled by its workflow
    Cancelled,
}

/// Link from a child run back to the parent that started it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Parent run
    pub run_id: Uuid,

    /// Parent business identifier
    pub workflow_id: String,

    /// Which attempt of the child this run is (1-based)
    pub child_attempt: u32,
}

/// Everything needed to create a run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub parent: Option<ParentLink>,
    pub run_timeout: Option<Duration>,
}

/// Stored view of a run
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub parent: Option<ParentLink>,
    pub run_timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Task definition for enqueueing
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
}

/// Task claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Fired when the owning workflow cancels the task
    pub cancellation: CancellationToken,
}

/// Outcome of a task failure
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Task will be retried after the delay
    WillRetry { next_attempt: u32, delay: Duration },

    /// No retry: attempts used up or the error is not retryable
    Exhausted { attempts: u32 },

    /// The task had already been cancelled; nothing to report
    Cancelled,
}

/// Event store for workflow runs, history and the activity task queue
///
/// All mutation of run state goes through this trait so another backend can
/// replace the in-memory one without touching the executor.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Create a run. Fails with `AlreadyStarted` while another run with the
    /// same workflow id is still running.
    async fn create_run(&self, run: NewRun) -> Result<(), StoreError>;

    /// Get a run by id
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Most recent run for a workflow id
    async fn latest_run(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError>;

    /// All runs for a workflow id, oldest first
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowInfo>, StoreError>;

    /// Append events with optimistic concurrency control
    ///
    /// `expected_sequence` is the current history length. Every event in the
    /// batch is stamped with `recorded_at`, which is also the logical time the
    /// workflow saw while producing them.
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        recorded_at: DateTime<Utc>,
        events: Vec<WorkflowEvent>,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Load the full history of a run
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Update run status, result and error
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue a new activity task
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim up to `max_tasks` due tasks for the given queue and types
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Mark a claimed task completed
    ///
    /// Returns false when the task is no longer claimed (e.g. cancelled), in
    /// which case the result must be dropped.
    async fn complete_task(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Record a failed attempt and apply the task's retry policy
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Cancel open tasks of a run (all, or one activity) and fire their tokens
    ///
    /// Returns the ids of the tasks that were cancelled.
    async fn cancel_tasks(
        &self,
        run_id: Uuid,
        activity_id: Option<&str>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Earliest backoff deadline among pending tasks of a queue
    async fn next_task_due(&self, task_queue: &str) -> Option<tokio::time::Instant>;

    /// Notified whenever a task becomes claimable
    fn task_notify(&self) -> Arc<Notify>;
}
