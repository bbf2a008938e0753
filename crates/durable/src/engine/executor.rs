//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting runs, including child runs on behalf of a parent
//! - Replaying a run from its history before every delivery
//! - Turning workflow actions into recorded events and their side effects
//! - Timers, run timeouts, cancellation and child retries

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{error_types, ActivityError, FailureKind};
use crate::persistence::{
    ClaimedTask, NewRun, ParentLink, StoreError, TaskDefinition, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus,
};
use crate::worker::ActivityOutcomeSink;
use crate::workflow::{
    ChildWorkflowOptions, HistoryEvent, WorkflowAction, WorkflowContext, WorkflowError,
    WorkflowEvent, WorkflowSignal,
};

use super::client::{RunDescription, RunHandle, StartWorkflowRequest, WorkflowClient};
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{self, OpenWork};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per run (for safety)
    pub max_events_per_run: usize,

    /// Task queue for runs started without one
    pub default_task_queue: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_run: 10000,
            default_task_queue: "default".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_default_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.default_task_queue = task_queue.into();
        self
    }

    pub fn with_max_events_per_run(mut self, max: usize) -> Self {
        self.max_events_per_run = max;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The run already reached a terminal state
    #[error("workflow {workflow_id} run {run_id} is already closed")]
    RunClosed { workflow_id: String, run_id: Uuid },

    /// History is malformed
    #[error("replay error: {0}")]
    ReplayError(String),

    /// Workflow code no longer produces the commands its history recorded
    #[error("nondeterminism detected: {0}")]
    Nondeterminism(String),

    /// Too many events
    #[error("run {0} has too many events ({1} >= {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// The executor is being dropped
    #[error("executor is shutting down")]
    ShuttingDown,
}

impl ExecutorError {
    /// Unknown workflow id or run id
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::RunNotFound(_) | StoreError::WorkflowNotFound(_))
        )
    }

    /// The request conflicts with the run's current state
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::AlreadyStarted { .. }) | Self::RunClosed { .. }
        )
    }

    /// Unknown workflow type or input it cannot accept
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::Registry(_))
    }
}

/// What happened to an event handed to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Recorded { closed: bool },
    /// Run closed or the event is stale or duplicated
    Ignored,
}

/// How a run closes
#[derive(Debug, Clone)]
enum Close {
    Completed(Value),
    Failed(WorkflowError),
    Cancelled(String),
}

impl Close {
    fn status(&self) -> WorkflowStatus {
        match self {
            Self::Completed(_) => WorkflowStatus::Completed,
            Self::Failed(_) => WorkflowStatus::Failed,
            Self::Cancelled(_) => WorkflowStatus::Cancelled,
        }
    }

    fn event(&self) -> WorkflowEvent {
        match self {
            Self::Completed(result) => WorkflowEvent::WorkflowCompleted {
                result: result.clone(),
            },
            Self::Failed(error) => WorkflowEvent::WorkflowFailed {
                error: error.clone(),
            },
            Self::Cancelled(reason) => WorkflowEvent::WorkflowCancelled {
                reason: reason.clone(),
            },
        }
    }

    fn into_parts(self) -> (Option<Value>, Option<WorkflowError>) {
        match self {
            Self::Completed(result) => (Some(result), None),
            Self::Failed(error) => (None, Some(error)),
            Self::Cancelled(reason) => (None, Some(WorkflowError::cancelled(reason))),
        }
    }
}

/// A child run to create once the parent's lock is released
#[derive(Debug, Clone)]
struct ChildStart {
    run_id: Uuid,
    workflow_id: String,
    workflow_type: String,
    input: Value,
    options: ChildWorkflowOptions,
}

/// Events to record and effects to apply for one delivery
#[derive(Debug, Default)]
struct Plan {
    events: Vec<WorkflowEvent>,
    tasks: Vec<TaskDefinition>,
    timers: Vec<(String, Duration)>,
    cancelled_timers: Vec<String>,
    cancelled_activities: Vec<String>,
    children: Vec<ChildStart>,
    children_to_cancel: Vec<String>,
    close: Option<Close>,
}

impl Plan {
    fn record(&mut self, open: &mut OpenWork, event: WorkflowEvent) {
        open.observe(&event);
        self.events.push(event);
    }
}

/// Work that touches other runs, done after the run lock is released
#[derive(Debug, Default)]
struct Followups {
    children: Vec<ChildStart>,
    children_to_cancel: Vec<String>,
    closed: Option<WorkflowInfo>,
}

/// Workflow executor
///
/// Drives workflow state machines by replaying history and applying the
/// actions they produce. Deliveries to one run are serialised by a per-run
/// lock; different runs progress concurrently. Work that reaches into other
/// runs (starting or cancelling children, reporting to a parent) happens
/// after the lock is released.
///
/// # Example
///
/// ```ignore
/// use flowline_durable::prelude::*;
///
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<MyWorkflow>();
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let executor = WorkflowExecutor::new(store, registry, ExecutorConfig::default());
///
/// let run = executor
///     .start_workflow(StartWorkflowRequest::new("my_workflow", "order-1", input))
///     .await?;
/// ```
pub struct WorkflowExecutor {
    this: Weak<WorkflowExecutor>,
    store: Arc<dyn WorkflowEventStore>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    timers: DashMap<(Uuid, String), JoinHandle<()>>,
    deadlines: DashMap<Uuid, JoinHandle<()>>,
    status_changed: Notify,
}

impl WorkflowExecutor {
    /// Create an executor over a store and a set of registered workflows
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        registry: WorkflowRegistry,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        info!(workflow_types = ?registry.workflow_types(), "creating workflow executor");
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            registry,
            config,
            run_locks: DashMap::new(),
            timers: DashMap::new(),
            deadlines: DashMap::new(),
            status_changed: Notify::new(),
        })
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    /// Get a reference to the registry
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Start a new run
    ///
    /// Fails with `AlreadyStarted` while a run with the same workflow id is
    /// still running.
    #[instrument(skip(self, request), fields(workflow_type = %request.workflow_type, workflow_id = %request.workflow_id))]
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<RunHandle, ExecutorError> {
        let run = NewRun {
            run_id: Uuid::now_v7(),
            workflow_id: request.workflow_id,
            workflow_type: request.workflow_type,
            task_queue: request
                .task_queue
                .unwrap_or_else(|| self.config.default_task_queue.clone()),
            input: request.input,
            parent: None,
            run_timeout: request.run_timeout,
        };
        self.start_run(run).await
    }

    /// Describe a run, or the latest run of a workflow id
    pub async fn describe(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<RunDescription, ExecutorError> {
        let info = match run_id {
            Some(run_id) => {
                let info = self.store.get_run(run_id).await?;
                if info.workflow_id != workflow_id {
                    return Err(StoreError::RunNotFound(run_id).into());
                }
                info
            }
            None => self.store.latest_run(workflow_id).await?,
        };
        Ok(info.into())
    }

    /// Wait for a run to close, bounded by `max_wait`
    ///
    /// Returns the run's description as soon as it is terminal, or its
    /// current description when the wait runs out.
    pub async fn wait_for_completion(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        max_wait: Duration,
    ) -> Result<RunDescription, ExecutorError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.status_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let description = self.describe(workflow_id, run_id).await?;
            if description.is_closed() {
                return Ok(description);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.describe(workflow_id, run_id).await;
            }
        }
    }

    /// Deliver a signal to a running workflow
    #[instrument(skip(self, signal), fields(signal_type = %signal.signal_type))]
    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        signal: WorkflowSignal,
    ) -> Result<RunHandle, ExecutorError> {
        let description = self.describe(workflow_id, run_id).await?;
        let closed = ExecutorError::RunClosed {
            workflow_id: description.workflow_id.clone(),
            run_id: description.run_id,
        };
        if description.is_closed() {
            return Err(closed);
        }

        match self
            .apply_event(description.run_id, WorkflowEvent::SignalReceived { signal })
            .await?
        {
            Delivery::Recorded { .. } => Ok(RunHandle::from(&description)),
            Delivery::Ignored => Err(closed),
        }
    }

    /// Ask a running workflow to cancel
    ///
    /// The workflow sees the request as a cancel signal; by default it closes
    /// as cancelled, taking its activities, timers and children with it.
    pub async fn cancel_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        reason: &str,
    ) -> Result<RunHandle, ExecutorError> {
        info!(workflow_id, reason, "cancellation requested");
        self.signal_workflow(workflow_id, run_id, WorkflowSignal::cancel(reason))
            .await
    }

    /// Full history of a run
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        Ok(self.store.load_events(run_id).await?)
    }

    /// Record an activity result and resume the workflow
    #[instrument(skip(self, task, result), fields(run_id = %task.run_id, activity_id = %task.activity_id, attempt = task.attempt))]
    pub async fn on_activity_completed(
        &self,
        task: &ClaimedTask,
        result: Value,
    ) -> Result<(), ExecutorError> {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: task.activity_id.clone(),
            result,
            attempt: task.attempt,
        };
        if self.apply_event(task.run_id, event).await? == Delivery::Ignored {
            debug!("activity result dropped");
        }
        Ok(())
    }

    /// Record an activity failure
    ///
    /// With `will_retry` the failure is only recorded; otherwise the workflow
    /// sees it, with a transient error turned terminal.
    #[instrument(skip(self, task, error), fields(run_id = %task.run_id, activity_id = %task.activity_id, attempt = task.attempt))]
    pub async fn on_activity_failed(
        &self,
        task: &ClaimedTask,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<(), ExecutorError> {
        let error = if will_retry { error } else { error.exhausted() };
        let event = WorkflowEvent::ActivityFailed {
            activity_id: task.activity_id.clone(),
            error,
            attempt: task.attempt,
            will_retry,
        };
        if self.apply_event(task.run_id, event).await? == Delivery::Ignored {
            debug!("activity failure dropped");
        }
        Ok(())
    }

    /// Abort every pending timer and run deadline
    pub fn shutdown(&self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
        for entry in self.deadlines.iter() {
            entry.value().abort();
        }
        self.deadlines.clear();
        info!("workflow executor stopped");
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn handle(&self) -> Result<Arc<Self>, ExecutorError> {
        self.this.upgrade().ok_or(ExecutorError::ShuttingDown)
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks.entry(run_id).or_default().clone()
    }

    fn start_run_boxed(&self, run: NewRun) -> BoxFuture<'_, Result<RunHandle, ExecutorError>> {
        Box::pin(self.start_run(run))
    }

    async fn start_run(&self, run: NewRun) -> Result<RunHandle, ExecutorError> {
        // Unknown types and unusable input are rejected before anything is stored
        self.registry.create(&run.workflow_type, run.input.clone())?;

        let handle = RunHandle {
            workflow_id: run.workflow_id.clone(),
            run_id: run.run_id,
            workflow_type: run.workflow_type.clone(),
        };
        let input = run.input.clone();
        let run_timeout = run.run_timeout;

        self.store.create_run(run).await?;
        info!(
            run_id = %handle.run_id,
            workflow_id = %handle.workflow_id,
            workflow_type = %handle.workflow_type,
            "workflow run created"
        );

        if let Some(timeout) = run_timeout {
            self.arm_run_timeout(handle.run_id, timeout);
        }
        self.status_changed.notify_waiters();

        self.apply_event(handle.run_id, WorkflowEvent::WorkflowStarted { input })
            .await?;
        Ok(handle)
    }

    fn apply_event_boxed(
        &self,
        run_id: Uuid,
        event: WorkflowEvent,
    ) -> BoxFuture<'_, Result<Delivery, ExecutorError>> {
        Box::pin(self.apply_event(run_id, event))
    }

    /// Deliver one event to a run
    ///
    /// The event and everything the workflow does in response are appended
    /// as one batch, stamped with the time the handler saw.
    #[instrument(skip(self, event), fields(event = event.kind()))]
    async fn apply_event(
        &self,
        run_id: Uuid,
        event: WorkflowEvent,
    ) -> Result<Delivery, ExecutorError> {
        let lock = self.run_lock(run_id);
        let guard = lock.lock().await;

        let info = self.store.get_run(run_id).await?;
        if info.status.is_terminal() {
            debug!(status = %info.status, "run already closed");
            drop(guard);
            self.run_locks.remove(&run_id);
            return Ok(Delivery::Ignored);
        }

        let history = self.store.load_events(run_id).await?;
        if history.len() >= self.config.max_events_per_run {
            return Err(ExecutorError::TooManyEvents(
                run_id,
                history.len(),
                self.config.max_events_per_run,
            ));
        }

        let mut open = OpenWork::from_history(&history);
        if !open.accepts(&event) {
            debug!("stale or duplicate event");
            return Ok(Delivery::Ignored);
        }

        let mut workflow = replay::replay(&self.registry, &info, &history)?;
        debug!(events = history.len(), "replayed history");

        let recorded_at = Utc::now();
        let ctx = WorkflowContext::new(
            info.workflow_id.clone(),
            run_id,
            info.workflow_type.clone(),
            recorded_at,
        );
        let actions = workflow.handle(&ctx, &event);
        open.observe(&event);

        let mut plan = self.plan(&info, &mut open, actions);
        let mut events = Vec::with_capacity(plan.events.len() + 1);
        events.push(event);
        events.append(&mut plan.events);

        self.store
            .append_events(run_id, history.len() as u64, recorded_at, events)
            .await?;

        let followups = self.commit(&info, plan).await?;
        drop(guard);

        let closed = followups.closed.is_some();
        self.run_followups(&info, followups).await;
        Ok(Delivery::Recorded { closed })
    }

    /// Translate workflow actions into events and effects
    fn plan(&self, info: &WorkflowInfo, open: &mut OpenWork, actions: Vec<WorkflowAction>) -> Plan {
        let actions = match validate_actions(open, &actions) {
            Ok(()) => actions,
            Err(reason) => {
                warn!(run_id = %info.run_id, %reason, "workflow produced an invalid action");
                vec![WorkflowAction::fail(
                    WorkflowError::new(format!("invalid action: {}", reason))
                        .with_code(error_types::INVALID_ACTION),
                )]
            }
        };

        let mut plan = Plan::default();
        for action in actions {
            if plan.close.is_some() {
                warn!(run_id = %info.run_id, "ignoring actions after the run closed");
                break;
            }

            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    plan.tasks.push(TaskDefinition {
                        run_id: info.run_id,
                        workflow_id: info.workflow_id.clone(),
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_queue: options
                            .task_queue
                            .clone()
                            .unwrap_or_else(|| info.task_queue.clone()),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    plan.record(
                        open,
                        WorkflowEvent::ActivityScheduled {
                            activity_id,
                            activity_type,
                            input,
                            options,
                        },
                    );
                }

                WorkflowAction::ScheduleChildWorkflow {
                    workflow_id,
                    workflow_type,
                    input,
                    options,
                } => {
                    let run_id = Uuid::now_v7();
                    plan.record(
                        open,
                        WorkflowEvent::ChildWorkflowStarted {
                            workflow_id: workflow_id.clone(),
                            run_id,
                            workflow_type: workflow_type.clone(),
                            options: options.clone(),
                        },
                    );
                    plan.children.push(ChildStart {
                        run_id,
                        workflow_id,
                        workflow_type,
                        input,
                        options,
                    });
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    plan.record(
                        open,
                        WorkflowEvent::TimerStarted {
                            timer_id: timer_id.clone(),
                            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                        },
                    );
                    plan.timers.push((timer_id, duration));
                }

                WorkflowAction::CancelTimer { timer_id } => {
                    if open.timers.contains(&timer_id) {
                        plan.record(
                            open,
                            WorkflowEvent::TimerCancelled {
                                timer_id: timer_id.clone(),
                            },
                        );
                        plan.cancelled_timers.push(timer_id);
                    }
                }

                WorkflowAction::CancelActivity { activity_id } => {
                    if open.activities.contains(&activity_id) {
                        plan.record(
                            open,
                            WorkflowEvent::ActivityCancelled {
                                activity_id: activity_id.clone(),
                                reason: "cancelled by workflow".to_string(),
                            },
                        );
                        plan.cancelled_activities.push(activity_id);
                    }
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    plan_close(open, &mut plan, Close::Completed(result));
                }

                WorkflowAction::FailWorkflow { error } => {
                    plan_close(open, &mut plan, Close::Failed(error));
                }

                WorkflowAction::CancelWorkflow { reason } => {
                    plan_close(open, &mut plan, Close::Cancelled(reason));
                }
            }
        }

        plan
    }

    /// Apply the effects of a recorded plan that stay within the run
    async fn commit(&self, info: &WorkflowInfo, plan: Plan) -> Result<Followups, ExecutorError> {
        let run_id = info.run_id;

        for task in plan.tasks {
            debug!(
                %run_id,
                activity_id = %task.activity_id,
                activity_type = %task.activity_type,
                "scheduling activity"
            );
            self.store.enqueue_task(task).await?;
        }

        for (timer_id, duration) in plan.timers {
            debug!(%run_id, %timer_id, ?duration, "starting timer");
            self.arm_timer(run_id, timer_id, duration);
        }

        for timer_id in &plan.cancelled_timers {
            self.disarm_timer(run_id, timer_id);
        }

        for activity_id in &plan.cancelled_activities {
            debug!(%run_id, %activity_id, "cancelling activity");
            self.store.cancel_tasks(run_id, Some(activity_id)).await?;
        }

        let closed = match plan.close {
            Some(close) => Some(self.close_run(info, close).await?),
            None => None,
        };

        Ok(Followups {
            children: plan.children,
            children_to_cancel: plan.children_to_cancel,
            closed,
        })
    }

    async fn close_run(&self, info: &WorkflowInfo, close: Close) -> Result<WorkflowInfo, ExecutorError> {
        let run_id = info.run_id;
        let cancelled = self.store.cancel_tasks(run_id, None).await?;
        self.disarm_all(run_id);

        match &close {
            Close::Completed(_) => info!(%run_id, workflow_id = %info.workflow_id, "workflow completed"),
            Close::Failed(error) => warn!(
                %run_id,
                workflow_id = %info.workflow_id,
                error = %error.message,
                kind = %error.kind,
                "workflow failed"
            ),
            Close::Cancelled(reason) => info!(
                %run_id,
                workflow_id = %info.workflow_id,
                %reason,
                cancelled_tasks = cancelled.len(),
                "workflow cancelled"
            ),
        }

        let status = close.status();
        let (result, error) = close.into_parts();
        self.store
            .update_run_status(run_id, status, result, error)
            .await?;
        Ok(self.store.get_run(run_id).await?)
    }

    async fn run_followups(&self, info: &WorkflowInfo, followups: Followups) {
        for child in followups.children {
            self.start_child(info, child, 1).await;
        }

        for child_id in &followups.children_to_cancel {
            self.cancel_child(info, child_id).await;
        }

        if let Some(closed) = followups.closed {
            self.run_locks.remove(&closed.run_id);
            self.status_changed.notify_waiters();
            if let Some(link) = closed.parent.clone() {
                if let Err(e) = self.report_to_parent(&link, closed).await {
                    error!(parent_run_id = %link.run_id, error = %e, "failed to report child outcome");
                }
            }
        }
    }

    // =========================================================================
    // Child workflows
    // =========================================================================

    async fn start_child(&self, parent: &WorkflowInfo, child: ChildStart, attempt: u32) {
        let run = NewRun {
            run_id: child.run_id,
            workflow_id: child.workflow_id.clone(),
            workflow_type: child.workflow_type,
            task_queue: child
                .options
                .task_queue
                .clone()
                .unwrap_or_else(|| parent.task_queue.clone()),
            input: child.input,
            parent: Some(ParentLink {
                run_id: parent.run_id,
                workflow_id: parent.workflow_id.clone(),
                child_attempt: attempt,
            }),
            run_timeout: child.options.run_timeout,
        };

        match self.start_run_boxed(run).await {
            Ok(_) => self.cancel_if_orphaned(parent, &child.workflow_id).await,
            Err(e) => self.report_child_start_failure(parent, child.workflow_id, e).await,
        }
    }

    /// Cancel a just-created child whose parent closed while it was being created
    ///
    /// The parent's close looks children up by id, so a child created after
    /// that lookup is only reached from here.
    async fn cancel_if_orphaned(&self, parent: &WorkflowInfo, child_id: &str) {
        match self.store.get_run(parent.run_id).await {
            Ok(current) if current.status.is_terminal() => {
                debug!(
                    parent_run_id = %parent.run_id,
                    child_workflow_id = child_id,
                    "parent closed while child was starting"
                );
                self.cancel_child(parent, child_id).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(parent_run_id = %parent.run_id, error = %e, "failed to read parent run");
            }
        }
    }

    async fn report_child_start_failure(
        &self,
        parent: &WorkflowInfo,
        child_workflow_id: String,
        e: ExecutorError,
    ) {
        warn!(
            parent_run_id = %parent.run_id,
            child_workflow_id = %child_workflow_id,
            error = %e,
            "child workflow failed to start"
        );
        let event = WorkflowEvent::ChildWorkflowFailed {
            workflow_id: child_workflow_id,
            error: WorkflowError::new(format!("failed to start child workflow: {}", e))
                .with_code(error_types::CHILD_START_FAILED),
        };
        if let Err(e) = self.apply_event_boxed(parent.run_id, event).await {
            error!(parent_run_id = %parent.run_id, error = %e, "failed to report child start failure");
        }
    }

    async fn cancel_child(&self, parent: &WorkflowInfo, child_id: &str) {
        let child = match self.store.latest_run(child_id).await {
            Ok(child) => child,
            Err(e) => {
                debug!(child_workflow_id = child_id, error = %e, "child run not found");
                return;
            }
        };
        let owned = child.parent.as_ref().map(|p| p.run_id) == Some(parent.run_id);
        if !owned || child.status.is_terminal() {
            return;
        }

        let signal = WorkflowSignal::cancel(format!("parent workflow {} closed", parent.workflow_id));
        if let Err(e) = self
            .apply_event_boxed(child.run_id, WorkflowEvent::SignalReceived { signal })
            .await
        {
            warn!(child_run_id = %child.run_id, error = %e, "failed to cancel child workflow");
        }
    }

    /// Hand a closed child's outcome to its parent, or retry the child
    async fn report_to_parent(&self, link: &ParentLink, child: WorkflowInfo) -> Result<(), ExecutorError> {
        let parent = self.store.get_run(link.run_id).await?;
        if parent.status.is_terminal() {
            debug!(parent_run_id = %link.run_id, "parent already closed, dropping child outcome");
            return Ok(());
        }

        let event = match child.status {
            WorkflowStatus::Running => return Ok(()),
            WorkflowStatus::Completed => WorkflowEvent::ChildWorkflowCompleted {
                workflow_id: child.workflow_id.clone(),
                result: child.result.clone().unwrap_or(Value::Null),
            },
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                let error = child
                    .error
                    .clone()
                    .unwrap_or_else(|| WorkflowError::new("child workflow closed without an error"));

                if child.status == WorkflowStatus::Failed {
                    if let Some(options) = self.child_options(link.run_id, &child.workflow_id).await? {
                        if child_should_retry(&options, &error, link.child_attempt) {
                            let attempt = link.child_attempt + 1;
                            let delay = options.retry_policy.delay_for_attempt(attempt);
                            warn!(
                                child_workflow_id = %child.workflow_id,
                                attempt,
                                ?delay,
                                error = %error.message,
                                "child workflow failed, retrying"
                            );
                            self.schedule_child_retry(child, options, error, attempt, delay)?;
                            return Ok(());
                        }
                    }
                }

                WorkflowEvent::ChildWorkflowFailed {
                    workflow_id: child.workflow_id.clone(),
                    error,
                }
            }
        };

        self.apply_event_boxed(link.run_id, event).await?;
        Ok(())
    }

    async fn child_options(
        &self,
        parent_run_id: Uuid,
        child_id: &str,
    ) -> Result<Option<ChildWorkflowOptions>, ExecutorError> {
        let history = self.store.load_events(parent_run_id).await?;
        Ok(history.into_iter().find_map(|entry| match entry.event {
            WorkflowEvent::ChildWorkflowStarted {
                workflow_id,
                options,
                ..
            } if workflow_id == child_id => Some(options),
            _ => None,
        }))
    }

    fn schedule_child_retry(
        &self,
        previous: WorkflowInfo,
        options: ChildWorkflowOptions,
        error: WorkflowError,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), ExecutorError> {
        let this = self.handle()?;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_child(previous, options, error, attempt).await;
        });
        Ok(())
    }

    async fn retry_child(
        &self,
        previous: WorkflowInfo,
        options: ChildWorkflowOptions,
        error: WorkflowError,
        attempt: u32,
    ) {
        let Some(link) = previous.parent.clone() else {
            return;
        };

        let run_id = Uuid::now_v7();
        let retried = WorkflowEvent::ChildWorkflowRetried {
            workflow_id: previous.workflow_id.clone(),
            run_id,
            attempt,
            error,
        };
        match self.apply_event_boxed(link.run_id, retried).await {
            Ok(Delivery::Recorded { .. }) => {}
            Ok(Delivery::Ignored) => {
                debug!(child_workflow_id = %previous.workflow_id, "parent no longer waits for child, skipping retry");
                return;
            }
            Err(e) => {
                error!(child_workflow_id = %previous.workflow_id, error = %e, "failed to record child retry");
                return;
            }
        }

        let parent = match self.store.get_run(link.run_id).await {
            Ok(parent) => parent,
            Err(e) => {
                error!(parent_run_id = %link.run_id, error = %e, "parent run vanished");
                return;
            }
        };

        let child = ChildStart {
            run_id,
            workflow_id: previous.workflow_id,
            workflow_type: previous.workflow_type,
            input: previous.input,
            options,
        };
        self.start_child(&parent, child, attempt).await;
    }

    // =========================================================================
    // Timers and run deadlines
    // =========================================================================

    fn arm_timer(&self, run_id: Uuid, timer_id: String, duration: Duration) {
        let Ok(this) = self.handle() else {
            return;
        };
        let key = (run_id, timer_id.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            this.timers.remove(&(run_id, timer_id.clone()));
            debug!(%run_id, %timer_id, "timer fired");
            if let Err(e) = this
                .apply_event_boxed(run_id, WorkflowEvent::TimerFired { timer_id })
                .await
            {
                error!(%run_id, error = %e, "failed to deliver timer");
            }
        });
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    fn disarm_timer(&self, run_id: Uuid, timer_id: &str) {
        if let Some((_, handle)) = self.timers.remove(&(run_id, timer_id.to_string())) {
            handle.abort();
        }
    }

    fn disarm_all(&self, run_id: Uuid) {
        self.timers.retain(|(owner, _), handle| {
            if *owner == run_id {
                handle.abort();
                false
            } else {
                true
            }
        });
        if let Some((_, handle)) = self.deadlines.remove(&run_id) {
            handle.abort();
        }
    }

    fn arm_run_timeout(&self, run_id: Uuid, timeout: Duration) {
        let Ok(this) = self.handle() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.deadlines.remove(&run_id);
            if let Err(e) = this.time_out_run_boxed(run_id, timeout).await {
                error!(%run_id, error = %e, "failed to time out run");
            }
        });
        self.deadlines.insert(run_id, handle);
    }

    fn time_out_run_boxed(
        &self,
        run_id: Uuid,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), ExecutorError>> {
        Box::pin(self.time_out_run(run_id, timeout))
    }

    /// Fail a run that outlived its run timeout
    #[instrument(skip(self))]
    async fn time_out_run(&self, run_id: Uuid, timeout: Duration) -> Result<(), ExecutorError> {
        let lock = self.run_lock(run_id);
        let guard = lock.lock().await;

        let info = self.store.get_run(run_id).await?;
        if info.status.is_terminal() {
            return Ok(());
        }

        let history = self.store.load_events(run_id).await?;
        let mut open = OpenWork::from_history(&history);
        let mut plan = Plan::default();
        let error = WorkflowError::timeout(format!(
            "workflow run exceeded its run timeout of {:?}",
            timeout
        ));
        plan_close(&mut open, &mut plan, Close::Failed(error));

        let events = std::mem::take(&mut plan.events);
        self.store
            .append_events(run_id, history.len() as u64, Utc::now(), events)
            .await?;

        let followups = self.commit(&info, plan).await?;
        drop(guard);

        self.run_followups(&info, followups).await;
        Ok(())
    }
}

/// Close a run, cancelling whatever it still owns
fn plan_close(open: &mut OpenWork, plan: &mut Plan, close: Close) {
    let reason = format!("workflow {}", close.status());
    for activity_id in open.activities.clone() {
        plan.record(
            open,
            WorkflowEvent::ActivityCancelled {
                activity_id,
                reason: reason.clone(),
            },
        );
    }
    for timer_id in open.timers.clone() {
        plan.record(open, WorkflowEvent::TimerCancelled { timer_id });
    }
    plan.children_to_cancel.extend(open.children.iter().cloned());
    plan.events.push(close.event());
    plan.close = Some(close);
}

/// Reject actions that reuse ids or carry an unusable retry policy
fn validate_actions(open: &OpenWork, actions: &[WorkflowAction]) -> Result<(), String> {
    let mut activities = HashSet::new();
    let mut timers = HashSet::new();
    let mut children = HashSet::new();

    for action in actions {
        match action {
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type,
                options,
                ..
            } => {
                if activity_id.is_empty() || activity_type.is_empty() {
                    return Err("activity id and type must not be empty".to_string());
                }
                if open.knows_activity(activity_id) || !activities.insert(activity_id.as_str()) {
                    return Err(format!("activity id {} is already in use", activity_id));
                }
                options
                    .retry_policy
                    .validate()
                    .map_err(|e| format!("activity {}: {}", activity_id, e))?;
            }
            WorkflowAction::ScheduleChildWorkflow {
                workflow_id,
                workflow_type,
                options,
                ..
            } => {
                if workflow_id.is_empty() || workflow_type.is_empty() {
                    return Err("child workflow id and type must not be empty".to_string());
                }
                if open.knows_child(workflow_id) || !children.insert(workflow_id.as_str()) {
                    return Err(format!("child workflow id {} is already in use", workflow_id));
                }
                options
                    .retry_policy
                    .validate()
                    .map_err(|e| format!("child workflow {}: {}", workflow_id, e))?;
            }
            WorkflowAction::StartTimer { timer_id, .. } => {
                if open.knows_timer(timer_id) || !timers.insert(timer_id.as_str()) {
                    return Err(format!("timer id {} is already in use", timer_id));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn child_should_retry(options: &ChildWorkflowOptions, error: &WorkflowError, attempt: u32) -> bool {
    let listed = error
        .code
        .as_ref()
        .is_some_and(|code| options.retry_policy.non_retryable_errors.contains(code));
    error.retryable
        && error.kind != FailureKind::Cancelled
        && !listed
        && options.retry_policy.has_attempts_remaining(attempt)
}

#[async_trait]
impl ActivityOutcomeSink for WorkflowExecutor {
    async fn activity_completed(&self, task: &ClaimedTask, result: Value) {
        if let Err(e) = self.on_activity_completed(task, result).await {
            error!(run_id = %task.run_id, activity_id = %task.activity_id, error = %e, "failed to record activity result");
        }
    }

    async fn activity_failed(&self, task: &ClaimedTask, error: ActivityError, will_retry: bool) {
        if let Err(e) = self.on_activity_failed(task, error, will_retry).await {
            error!(run_id = %task.run_id, activity_id = %task.activity_id, error = %e, "failed to record activity failure");
        }
    }
}

#[async_trait]
impl WorkflowClient for WorkflowExecutor {
    async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<RunHandle, ExecutorError> {
        WorkflowExecutor::start_workflow(self, request).await
    }

    async fn describe(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<RunDescription, ExecutorError> {
        WorkflowExecutor::describe(self, workflow_id, run_id).await
    }

    async fn wait_for_completion(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        max_wait: Duration,
    ) -> Result<RunDescription, ExecutorError> {
        WorkflowExecutor::wait_for_completion(self, workflow_id, run_id, max_wait).await
    }

    async fn cancel_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        reason: &str,
    ) -> Result<RunHandle, ExecutorError> {
        WorkflowExecutor::cancel_workflow(self, workflow_id, run_id, reason).await
    }

    fn workflow_types(&self) -> Vec<String> {
        self.registry.workflow_types()
    }
}
