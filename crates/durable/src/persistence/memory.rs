//! In-memory implementation of WorkflowEventStore

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Internal run state
struct RunState {
    info: WorkflowInfo,
    events: Vec<HistoryEvent>,
}

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    not_before: Instant,
    cancellation: CancellationToken,
    error_history: Vec<String>,
}

/// In-memory implementation of WorkflowEventStore
///
/// Backs the in-process engine. Tasks are claimed oldest first (task ids
/// are UUID v7); retry backoff uses tokio time so paused-clock tests
/// advance through it instantly.
///
/// # Example
///
/// ```
/// use flowline_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    runs: RwLock<HashMap<Uuid, RunState>>,
    runs_by_workflow: RwLock<HashMap<String, Vec<Uuid>>>,
    tasks: RwLock<BTreeMap<Uuid, TaskState>>,
    task_notify: Arc<Notify>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            runs_by_workflow: RwLock::new(HashMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
            task_notify: Arc::new(Notify::new()),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Status of every task for one activity of a run, oldest first
    pub fn task_statuses(&self, run_id: Uuid, activity_id: &str) -> Vec<TaskStatus> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.definition.run_id == run_id && t.definition.activity_id == activity_id)
            .map(|t| t.status)
            .collect()
    }

    /// Errors recorded for a task's failed attempts
    pub fn task_errors(&self, task_id: Uuid) -> Vec<String> {
        self.tasks
            .read()
            .get(&task_id)
            .map(|t| t.error_history.clone())
            .unwrap_or_default()
    }

    fn wake_pollers(&self) {
        self.task_notify.notify_waiters();
        // Leaves a permit for a poller that is between checks
        self.task_notify.notify_one();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_run(&self, run: NewRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let mut by_workflow = self.runs_by_workflow.write();

        if let Some(previous) = by_workflow.get(&run.workflow_id) {
            let still_running = previous.iter().find(|id| {
                runs.get(id)
                    .map(|r| r.info.status == WorkflowStatus::Running)
                    .unwrap_or(false)
            });
            if let Some(run_id) = still_running {
                return Err(StoreError::AlreadyStarted {
                    workflow_id: run.workflow_id,
                    run_id: *run_id,
                });
            }
        }

        by_workflow
            .entry(run.workflow_id.clone())
            .or_default()
            .push(run.run_id);
        runs.insert(
            run.run_id,
            RunState {
                info: WorkflowInfo {
                    run_id: run.run_id,
                    workflow_id: run.workflow_id,
                    workflow_type: run.workflow_type,
                    task_queue: run.task_queue,
                    status: WorkflowStatus::Running,
                    input: run.input,
                    result: None,
                    error: None,
                    parent: run.parent,
                    run_timeout: run.run_timeout,
                    created_at: Utc::now(),
                    closed_at: None,
                },
                events: vec![],
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.info.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn latest_run(&self, workflow_id: &str) -> Result<WorkflowInfo, StoreError> {
        let runs = self.runs.read();
        let by_workflow = self.runs_by_workflow.read();
        let run_id = by_workflow
            .get(workflow_id)
            .and_then(|ids| ids.last())
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        runs.get(run_id)
            .map(|r| r.info.clone())
            .ok_or(StoreError::RunNotFound(*run_id))
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<WorkflowInfo>, StoreError> {
        let runs = self.runs.read();
        let by_workflow = self.runs_by_workflow.read();
        let ids = by_workflow
            .get(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(ids
            .iter()
            .filter_map(|id| runs.get(id).map(|r| r.info.clone()))
            .collect())
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        recorded_at: DateTime<Utc>,
        events: Vec<WorkflowEvent>,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        let current_sequence = run.events.len() as u64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let appended: Vec<HistoryEvent> = events
            .into_iter()
            .enumerate()
            .map(|(offset, event)| HistoryEvent {
                sequence: current_sequence + offset as u64,
                recorded_at,
                event,
            })
            .collect();

        run.events.extend(appended.iter().cloned());
        Ok(appended)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.events.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;

        if run.info.status.is_terminal() {
            return Err(StoreError::RunClosed(run_id));
        }

        run.info.status = status;
        run.info.result = result;
        run.info.error = error;
        if status.is_terminal() {
            run.info.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        self.tasks.write().insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                not_before: Instant::now(),
                cancellation: CancellationToken::new(),
                error_history: vec![],
            },
        );
        self.wake_pollers();
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = Instant::now();
        let mut tasks = self.tasks.write();
        let mut claimed = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if claimed.len() >= max_tasks {
                break;
            }

            let due = task.status == TaskStatus::Pending && task.not_before <= now;
            if due
                && task.definition.task_queue == task_queue
                && activity_types.contains(&task.definition.activity_type)
            {
                task.status = TaskStatus::Claimed;
                task.attempt += 1;

                claimed.push(ClaimedTask {
                    id: *task_id,
                    run_id: task.definition.run_id,
                    workflow_id: task.definition.workflow_id.clone(),
                    activity_id: task.definition.activity_id.clone(),
                    activity_type: task.definition.activity_type.clone(),
                    task_queue: task.definition.task_queue.clone(),
                    input: task.definition.input.clone(),
                    options: task.definition.options.clone(),
                    attempt: task.attempt,
                    max_attempts: task.definition.options.retry_policy.max_attempts,
                    cancellation: task.cancellation.clone(),
                });
            }
        }

        if !claimed.is_empty() {
            tracing::trace!(worker_id, task_queue, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Claimed {
            return Ok(false);
        }
        task.status = TaskStatus::Completed;
        Ok(true)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let outcome = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(&task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;

            if task.status == TaskStatus::Cancelled {
                return Ok(TaskFailureOutcome::Cancelled);
            }

            task.error_history.push(error.to_string());
    
            let policy = &task.definition.options.retry_policy;
            if policy.should_retry(error) && policy.has_attempts_remaining(task.attempt) {
                let next_attempt = task.attempt + 1;
                let delay = policy.delay_for_attempt(next_attempt);
                task.status = TaskStatus::Pending;
                task.not_before = Instant::now() + delay;

                TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                }
            } else {
                task.status = TaskStatus::Failed;
                TaskFailureOutcome::Exhausted {
                    attempts: task.attempt,
                }
            }
        };

        if matches!(outcome, TaskFailureOutcome::WillRetry { .. }) {
            self.wake_pollers();
        }
        Ok(outcome)
    }

    async fn cancel_tasks(
        &self,
        run_id: Uuid,
        activity_id: Option<&str>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut cancelled = vec![];

        for (task_id, task) in tasks.iter_mut() {
            let open = matches!(task.status, TaskStatus::Pending | TaskStatus::Claimed);
            let matches_activity =
                activity_id.map_or(true, |id| task.definition.activity_id == id);

            if open && task.definition.run_id == run_id && matches_activity {
                task.status = TaskStatus::Cancelled;
                task.cancellation.cancel();
                cancelled.push(*task_id);
            }
        }

        Ok(cancelled)
    }

    async fn next_task_due(&self, task_queue: &str) -> Option<Instant> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.definition.task_queue == task_queue)
            .map(|t| t.not_before)
            .min()
    }

    fn task_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.task_notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::workflow::ActivityOptions;
    use serde_json::json;
    use std::time::Duration;

    fn new_run(workflow_id: &str) -> NewRun {
        NewRun {
            run_id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            workflow_type: "test".to_string(),
            task_queue: "q".to_string(),
            input: json!({}),
            parent: None,
            run_timeout: None,
        }
    }

    fn task(run_id: Uuid, policy: RetryPolicy) -> TaskDefinition {
        TaskDefinition {
            run_id,
            workflow_id: "wf".to_string(),
            activity_id: "1-step".to_string(),
            activity_type: "step".to_string(),
            task_queue: "q".to_string(),
            input: json!({"n": 1}),
            options: ActivityOptions::default().with_retry(policy),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let store = InMemoryWorkflowEventStore::new();
        let run = new_run("wf-1");
        let run_id = run.run_id;

        store.create_run(run).await.unwrap();

        let info = store.get_run(run_id).await.unwrap();
        assert_eq!(info.workflow_id, "wf-1");
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(store.latest_run("wf-1").await.unwrap().run_id, run_id);
    }

    #[tokio::test]
    async fn test_duplicate_running_workflow_id_rejected() {
        let store = InMemoryWorkflowEventStore::new();
        let first = new_run("wf-1");
        let first_id = first.run_id;
        store.create_run(first).await.unwrap();

        let err = store.create_run(new_run("wf-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyStarted { run_id, .. } if run_id == first_id));

        store
            .update_run_status(first_id, WorkflowStatus::Failed, None, None)
            .await
            .unwrap();
        store.create_run(new_run("wf-1")).await.unwrap();
        assert_eq!(store.list_runs("wf-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_events_concurrency() {
        let store = InMemoryWorkflowEventStore::new();
        let run = new_run("wf-1");
        let run_id = run.run_id;
        store.create_run(run).await.unwrap();

        let appended = store
            .append_events(
                run_id,
                0,
                Utc::now(),
                vec![WorkflowEvent::WorkflowStarted { input: json!({}) }],
            )
            .await
            .unwrap();
        assert_eq!(appended[0].sequence, 0);

        let result = store
            .append_events(
                run_id,
                0,
                Utc::now(),
                vec![WorkflowEvent::WorkflowStarted { input: json!({}) }],
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_closed_run_cannot_change() {
        let store = InMemoryWorkflowEventStore::new();
        let run = new_run("wf-1");
        let run_id = run.run_id;
        store.create_run(run).await.unwrap();

        store
            .update_run_status(run_id, WorkflowStatus::Completed, Some(json!(1)), None)
            .await
            .unwrap();
        let err = store
            .update_run_status(run_id, WorkflowStatus::Failed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_task_backs_off_then_exhausts() {
        let store = InMemoryWorkflowEventStore::new();
        let policy = RetryPolicy::exponential()
            .with_max_attempts(2)
            .with_jitter(0.0);
        let task_id = store.enqueue_task(task(Uuid::now_v7(), policy)).await.unwrap();
        let types = vec!["step".to_string()];

        let claimed = store.claim_tasks("w", "q", &types, 10).await.unwrap();
        assert_eq!(claimed[0].attempt, 1);

        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("blip"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TaskFailureOutcome::WillRetry {
                next_attempt: 2,
                delay: Duration::from_secs(1)
            }
        );

        // Not claimable until the backoff elapses
        assert!(store.claim_tasks("w", "q", &types, 10).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        let claimed = store.claim_tasks("w", "q", &types, 10).await.unwrap();
        assert_eq!(claimed[0].attempt, 2);

        let outcome = store
            .fail_task(task_id, &ActivityError::retryable("blip"))
            .await
            .unwrap();
        assert_eq!(outcome, TaskFailureOutcome::Exhausted { attempts: 2 });
        assert_eq!(store.task_errors(task_id).len(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_final() {
        let store = InMemoryWorkflowEventStore::new();
        let task_id = store
            .enqueue_task(task(Uuid::now_v7(), RetryPolicy::exponential()))
            .await
            .unwrap();
        store
            .claim_tasks("w", "q", &["step".to_string()], 1)
            .await
            .unwrap();

        let outcome = store
            .fail_task(task_id, &ActivityError::non_retryable("bad input"))
            .await
            .unwrap();
        assert_eq!(outcome, TaskFailureOutcome::Exhausted { attempts: 1 });
    }

    #[tokio::test]
    async fn test_cancel_tasks_fires_token() {
        let store = InMemoryWorkflowEventStore::new();
        let run_id = Uuid::now_v7();
        let task_id = store
            .enqueue_task(task(run_id, RetryPolicy::exponential()))
            .await
            .unwrap();
        let claimed = store
            .claim_tasks("w", "q", &["step".to_string()], 1)
            .await
            .unwrap();

        let cancelled = store.cancel_tasks(run_id, None).await.unwrap();

        assert_eq!(cancelled, vec![task_id]);
        assert!(claimed[0].cancellation.is_cancelled());
        assert!(!store.complete_task(task_id).await.unwrap());
        assert_eq!(
            store
                .fail_task(task_id, &ActivityError::cancelled("stop"))
                .await
                .unwrap(),
            TaskFailureOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_claim_respects_queue_and_type() {
        let store = InMemoryWorkflowEventStore::new();
        store
            .enqueue_task(task(Uuid::now_v7(), RetryPolicy::exponential()))
            .await
            .unwrap();

        assert!(store
            .claim_tasks("w", "other-queue", &["step".to_string()], 1)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .claim_tasks("w", "q", &["other".to_string()], 1)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.pending_task_count(), 1);
    }
}
