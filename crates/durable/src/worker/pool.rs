//! Worker pool for task execution
//!
//! Claims activity tasks from the store, runs them with bounded concurrency
//! and hands their outcomes back to the engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{error_types, Activity, ActivityContext, ActivityError};
use crate::persistence::{ClaimedTask, StoreError, TaskFailureOutcome, WorkflowEventStore};
use crate::reliability::duration_millis;

/// Receives the outcome of each executed task
///
/// Called after the store has recorded the outcome. `will_retry` is true
/// when the store scheduled another attempt.
#[async_trait]
pub trait ActivityOutcomeSink: Send + Sync {
    async fn activity_completed(&self, task: &ClaimedTask, result: Value);

    async fn activity_failed(&self, task: &ClaimedTask, error: ActivityError, will_retry: bool);
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queue this pool claims from
    pub task_queue: String,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Fallback poll interval when no notification arrives
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrency: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration for one task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the fallback poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} tasks still running")]
    ShutdownTimeout(usize),
}

/// Activity handler function type
pub type ActivityHandler = Arc<dyn Fn(ActivityContext, Value) -> HandlerFuture + Send + Sync>;

/// Future returned by an [`ActivityHandler`]
pub type HandlerFuture = BoxFuture<'static, Result<Value, ActivityError>>;

/// Adapt a typed activity to the JSON handler signature
pub fn activity_handler<A: Activity>(activity: A) -> ActivityHandler {
    let activity = Arc::new(activity);
    Arc::new(move |ctx: ActivityContext, input: Value| -> HandlerFuture {
        let activity = Arc::clone(&activity);
        Box::pin(async move {
            let input: A::Input = serde_json::from_value(input).map_err(|e| {
                ActivityError::non_retryable(format!("invalid input for {}: {}", A::TYPE, e))
                    .with_type(error_types::PARSE_ERROR)
            })?;
            let output = activity.execute(&ctx, input).await?;
            serde_json::to_value(output).map_err(|e| {
                ActivityError::non_retryable(format!(
                    "failed to serialize output of {}: {}",
                    A::TYPE,
                    e
                ))
            })
        })
    })
}

type HandlerMap = Arc<RwLock<HashMap<String, ActivityHandler>>>;

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use flowline_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new("orders").with_max_concurrency(10);
/// let pool = WorkerPool::new(store, executor, config);
///
/// pool.register_activity(SendEmailActivity);
/// pool.register_handler("ping", |_ctx, input| async move { Ok(input) });
///
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn WorkflowEventStore>,
    sink: Arc<dyn ActivityOutcomeSink>,
    config: WorkerPoolConfig,
    handlers: HandlerMap,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    capacity_freed: Arc<Notify>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        sink: Arc<dyn ActivityOutcomeSink>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let active_tasks = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            store,
            sink,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks,
            capacity_freed: Arc::new(Notify::new()),
            poll_handle: Mutex::new(None),
        }
    }

    /// Register an activity handler closure
    pub fn register_handler<F, Fut>(&self, activity_type: &str, handler: F)
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.insert_handler(
            activity_type,
            Arc::new(move |ctx: ActivityContext, input: Value| -> HandlerFuture {
                Box::pin(handler(ctx, input))
            }),
        );
    }

    /// Register a typed activity
    ///
    /// Input that does not decode into `A::Input` fails the task with a
    /// non-retryable `ParseError`.
    pub fn register_activity<A: Activity>(&self, activity: A) {
        self.insert_handler(A::TYPE, activity_handler(activity));
    }

    /// Register a pre-built handler
    pub fn insert_handler(&self, activity_type: &str, handler: ActivityHandler) {
        debug!(activity_type, "registering activity handler");
        self.handlers
            .write()
            .insert(activity_type.to_string(), handler);
    }

    /// Registered activity types, sorted
    pub fn activity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            activity_types = ?self.activity_types(),
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        self.shutdown_tx.send_replace(false);
        self.start_poll_loop();
        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming, then waits up to `shutdown_timeout` for running tasks.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Running {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "poll loop ended abnormally");
            }
        }

        let permits = u32::try_from(self.config.max_concurrency).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.active_tasks.acquire_many(permits),
        )
        .await;

        *self.status.write() = WorkerPoolStatus::Stopped;

        match drained {
            Ok(_) => {
                info!(worker_id = %self.config.worker_id, "worker pool stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.active_count();
                warn!(remaining_tasks = remaining, "shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout(remaining))
            }
        }
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of tasks currently executing
    pub fn active_count(&self) -> usize {
        self.config
            .max_concurrency
            .saturating_sub(self.active_tasks.available_permits())
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Start the polling loop
    fn start_poll_loop(&self) {
        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();
        let handlers = Arc::clone(&self.handlers);
        let active_tasks = Arc::clone(&self.active_tasks);
        let capacity_freed = Arc::clone(&self.capacity_freed);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let task_notify = store.task_notify();

            loop {
                if *shutdown_rx.borrow() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                // Registered before claiming so a task enqueued meanwhile still wakes us
                let task_ready = task_notify.notified();
                tokio::pin!(task_ready);
                task_ready.as_mut().enable();
                let capacity = capacity_freed.notified();
                tokio::pin!(capacity);
                capacity.as_mut().enable();

                let available = active_tasks.available_permits();
                let activity_types: Vec<String> = handlers.read().keys().cloned().collect();

                if available > 0 && !activity_types.is_empty() {
                    match store
                        .claim_tasks(&config.worker_id, &config.task_queue, &activity_types, available)
                        .await
                    {
                        Ok(tasks) => {
                            for task in tasks {
                                let Ok(permit) = Arc::clone(&active_tasks).acquire_owned().await
                                else {
                                    break;
                                };
                                let handler = handlers.read().get(&task.activity_type).cloned();
                                let store = Arc::clone(&store);
                                let sink = Arc::clone(&sink);
                                let capacity_freed = Arc::clone(&capacity_freed);

                                tokio::spawn(async move {
                                    execute_task(store.as_ref(), sink.as_ref(), handler, task).await;
                                    drop(permit);
                                    capacity_freed.notify_one();
                                });
                            }
                        }
                        Err(e) => error!(error = %e, "failed to claim tasks"),
                    }
                }

                let now = Instant::now();
                let mut wake_at = now + config.poll_interval;
                if let Some(due) = store.next_task_due(&config.task_queue).await {
                    if due > now && due < wake_at {
                        wake_at = due;
                    }
                }

                tokio::select! {
                    _ = &mut task_ready => {}
                    _ = &mut capacity => {}
                    _ = tokio::time::sleep_until(wake_at) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

/// Run one claimed task and record its outcome
#[instrument(
    skip_all,
    fields(
        task_id = %task.id,
        workflow_id = %task.workflow_id,
        activity_id = %task.activity_id,
        activity_type = %task.activity_type,
        attempt = task.attempt
    )
)]
async fn execute_task(
    store: &dyn WorkflowEventStore,
    sink: &dyn ActivityOutcomeSink,
    handler: Option<ActivityHandler>,
    task: ClaimedTask,
) {
    let outcome = match handler {
        None => Err(ActivityError::non_retryable(format!(
            "no handler registered for activity type {}",
            task.activity_type
        ))
        .with_type(error_types::UNKNOWN_ACTIVITY)),
        Some(handler) => {
            let ctx = ActivityContext::new(
                task.run_id,
                task.workflow_id.clone(),
                task.activity_id.clone(),
                task.activity_type.clone(),
                task.attempt,
                task.max_attempts,
            )
            .with_cancellation(task.cancellation.clone());
            let timeout = task.options.start_to_close_timeout;

            debug!("executing activity");
            tokio::select! {
                biased;
                _ = task.cancellation.cancelled() => {
                    debug!("activity cancelled while running");
                    return;
                }
                result = tokio::time::timeout(timeout, handler(ctx, task.input.clone())) => {
                    match result {
                        Ok(result) => result,
                        Err(_) => Err(ActivityError::timeout(format!(
                            "{} exceeded its start-to-close timeout of {:?}",
                            task.activity_type, timeout
                        ))),
                    }
                }
            }
        }
    };

    match outcome {
        Ok(result) => match store.complete_task(task.id).await {
            Ok(true) => {
                debug!("activity completed");
                sink.activity_completed(&task, result).await;
            }
            Ok(false) => debug!("task no longer claimed, dropping result"),
            Err(e) => error!(error = %e, "failed to complete task"),
        },
        Err(error) => match store.fail_task(task.id, &error).await {
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            }) => {
                warn!(error = %error, kind = %error.kind, next_attempt, ?delay, "activity failed, will retry");
                sink.activity_failed(&task, error, true).await;
            }
            Ok(TaskFailureOutcome::Exhausted { attempts }) => {
                warn!(error = %error, kind = %error.kind, attempts, "activity failed for good");
                sink.activity_failed(&task, error, false).await;
            }
            Ok(TaskFailureOutcome::Cancelled) => debug!("task cancelled, dropping failure"),
            Err(e) => error!(error = %e, "failed to record task failure"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::FailureKind;
    use crate::persistence::{InMemoryWorkflowEventStore, TaskDefinition, TaskStatus};
    use crate::reliability::RetryPolicy;
    use crate::workflow::ActivityOptions;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        completed: Mutex<Vec<(String, Value)>>,
        failed: Mutex<Vec<(String, ActivityError, bool)>>,
    }

    #[async_trait]
    impl ActivityOutcomeSink for RecordingSink {
        async fn activity_completed(&self, task: &ClaimedTask, result: Value) {
            self.completed.lock().push((task.activity_id.clone(), result));
        }

        async fn activity_failed(&self, task: &ClaimedTask, error: ActivityError, will_retry: bool) {
            self.failed
                .lock()
                .push((task.activity_id.clone(), error, will_retry));
        }
    }

    struct Doubler;

    #[derive(Serialize, Deserialize)]
    struct DoublerInput {
        n: i64,
    }

    #[async_trait]
    impl Activity for Doubler {
        const TYPE: &'static str = "double";
        type Input = DoublerInput;
        type Output = Value;

        async fn execute(&self, _ctx: &ActivityContext, input: Self::Input) -> Result<Value, ActivityError> {
            Ok(json!({ "n": input.n * 2 }))
        }
    }

    fn setup() -> (Arc<InMemoryWorkflowEventStore>, Arc<RecordingSink>, WorkerPool) {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkerPool::new(
            store.clone(),
            sink.clone(),
            WorkerPoolConfig::new("q").with_worker_id("test-worker"),
        );
        (store, sink, pool)
    }

    fn task(activity_type: &str, input: Value, options: ActivityOptions) -> TaskDefinition {
        TaskDefinition {
            run_id: Uuid::now_v7(),
            workflow_id: "wf".to_string(),
            activity_id: format!("1-{}", activity_type),
            activity_type: activity_type.to_string(),
            task_queue: "q".to_string(),
            input,
            options,
        }
    }

    fn no_retry() -> ActivityOptions {
        ActivityOptions::default().with_retry(RetryPolicy::no_retry())
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.task_queue, "default");
        assert_eq!(config.max_concurrency, 5);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("hello-world-queue")
            .with_worker_id("test-worker")
            .with_max_concurrency(0)
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queue, "hello-world-queue");
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_activity_completes() {
        let (store, sink, pool) = setup();
        pool.register_activity(Doubler);
        pool.start().unwrap();

        store
            .enqueue_task(task("double", json!({ "n": 21 }), no_retry()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            sink.completed.lock().clone(),
            vec![("1-double".to_string(), json!({ "n": 42 }))]
        );
        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_input_is_a_parse_error() {
        let (store, sink, pool) = setup();
        pool.register_activity(Doubler);
        pool.start().unwrap();

        store
            .enqueue_task(task("double", json!("not an object"), ActivityOptions::default()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let failed = sink.failed.lock().clone();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1.error_type.as_deref(), Some(error_types::PARSE_ERROR));
        assert!(!failed[0].2);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_retry_until_exhausted() {
        let (store, sink, pool) = setup();
        pool.register_handler("flaky", |_ctx, _input| async move {
            Err(ActivityError::retryable("simulated processing error"))
        });
        pool.start().unwrap();

        let policy = RetryPolicy::fixed(Duration::from_secs(1), 3);
        store
            .enqueue_task(task("flaky", json!({}), ActivityOptions::default().with_retry(policy)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let retries: Vec<bool> = sink.failed.lock().iter().map(|(_, _, r)| *r).collect();
        assert_eq!(retries, vec![true, true, false]);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_to_close_timeout() {
        let (store, sink, pool) = setup();
        pool.register_handler("slow", |_ctx, input| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(input)
        });
        pool.start().unwrap();

        let options = no_retry().with_start_to_close_timeout(Duration::from_secs(2));
        store
            .enqueue_task(task("slow", json!({}), options))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let failed = sink.failed.lock().clone();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].1.kind, FailureKind::Timeout);
        assert!(sink.completed.lock().is_empty());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_reports_nothing() {
        let (store, sink, pool) = setup();
        pool.register_handler("slow", |ctx: ActivityContext, input| async move {
            ctx.cancelled().await;
            Ok(input)
        });
        pool.start().unwrap();

        let definition = task("slow", json!({}), no_retry());
        let run_id = definition.run_id;
        store.enqueue_task(definition).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.active_count(), 1);

        store.cancel_tasks(run_id, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(pool.active_count(), 0);
        assert!(sink.completed.lock().is_empty());
        assert!(sink.failed.lock().is_empty());
        assert_eq!(store.task_statuses(run_id, "1-slow"), vec![TaskStatus::Cancelled]);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let sink = Arc::new(RecordingSink::default());
        let pool = WorkerPool::new(
            store.clone(),
            sink.clone(),
            WorkerPoolConfig::new("q").with_max_concurrency(2),
        );
        pool.register_handler("wait", |_ctx, input| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(input)
        });
        pool.start().unwrap();

        for _ in 0..3 {
            store
                .enqueue_task(task("wait", json!({}), no_retry()))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.active_count(), 2);
        assert_eq!(store.pending_task_count(), 1);

        // The third task waits for a slot, so it finishes around t=20s
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.completed.lock().len(), 2);
        assert_eq!(pool.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sink.completed.lock().len(), 3);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_store, _sink, pool) = setup();
        pool.start().unwrap();

        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));
        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
    }
}
