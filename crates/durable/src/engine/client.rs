//! Caller-facing contract: start, inspect and cancel workflow runs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::{WorkflowInfo, WorkflowStatus};
use crate::reliability::option_duration_millis;
use crate::workflow::WorkflowError;

use super::executor::ExecutorError;

/// Request to start a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    /// Registered workflow type
    pub workflow_type: String,

    /// Business identifier chosen by the caller
    pub workflow_id: String,

    /// Queue for the run's activities; the engine default when unset
    #[serde(default)]
    pub task_queue: Option<String>,

    /// Workflow input
    #[serde(default)]
    pub input: serde_json::Value,

    /// Upper bound on the run's duration
    #[serde(default, with = "option_duration_millis")]
    pub run_timeout: Option<Duration>,
}

impl StartWorkflowRequest {
    pub fn new(
        workflow_type: impl Into<String>,
        workflow_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            workflow_id: workflow_id.into(),
            task_queue: None,
            input,
            run_timeout: None,
        }
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// Identity of a started run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
}

/// Point-in-time view of a run, as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescription {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Business id of the parent when this run is a child
    pub parent_workflow_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl RunDescription {
    /// Whether the run reached a terminal state
    pub fn is_closed(&self) -> bool {
        self.status.is_terminal()
    }
}

impl From<WorkflowInfo> for RunDescription {
    fn from(info: WorkflowInfo) -> Self {
        Self {
            workflow_id: info.workflow_id,
            run_id: info.run_id,
            workflow_type: info.workflow_type,
            status: info.status,
            result: info.result,
            error: info.error,
            parent_workflow_id: info.parent.map(|p| p.workflow_id),
            created_at: info.created_at,
            closed_at: info.closed_at,
        }
    }
}

impl From<&RunDescription> for RunHandle {
    fn from(description: &RunDescription) -> Self {
        Self {
            workflow_id: description.workflow_id.clone(),
            run_id: description.run_id,
            workflow_type: description.workflow_type.clone(),
        }
    }
}

/// What an external caller can do with the engine
///
/// Status is always read from the run record, so a caller polling
/// `describe` and one blocked in `wait_for_completion` see the same answer.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Start a run of a registered workflow type
    async fn start_workflow(&self, request: StartWorkflowRequest)
        -> Result<RunHandle, ExecutorError>;

    /// Describe a run; the latest run of the workflow id when `run_id` is unset
    async fn describe(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<RunDescription, ExecutorError>;

    /// Wait until the run closes or `max_wait` elapses, then describe it
    async fn wait_for_completion(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        max_wait: Duration,
    ) -> Result<RunDescription, ExecutorError>;

    /// Ask a running workflow to cancel
    async fn cancel_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        reason: &str,
    ) -> Result<RunHandle, ExecutorError>;

    /// Registered workflow types, sorted
    fn workflow_types(&self) -> Vec<String>;
}
