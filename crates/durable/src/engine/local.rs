//! In-process engine: store, executor and worker pool wired together

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::persistence::{InMemoryWorkflowEventStore, WorkflowEventStore};
use crate::worker::{
    activity_handler, ActivityHandler, HandlerFuture, WorkerPool, WorkerPoolConfig,
    WorkerPoolError,
};
use crate::workflow::Workflow;

use super::client::WorkflowClient;
use super::executor::{ExecutorConfig, WorkflowExecutor};
use super::registry::WorkflowRegistry;

/// Builder for a [`LocalEngine`]
///
/// # Example
///
/// ```ignore
/// let engine = LocalEngine::builder()
///     .with_task_queue("orders")
///     .register_workflow::<OrderWorkflow>()
///     .register_activity(ChargeCard)
///     .build();
///
/// engine.start()?;
/// let client = engine.client();
/// ```
pub struct LocalEngineBuilder {
    store: Option<Arc<dyn WorkflowEventStore>>,
    registry: WorkflowRegistry,
    executor_config: ExecutorConfig,
    worker_config: WorkerPoolConfig,
    handlers: Vec<(String, ActivityHandler)>,
}

impl LocalEngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            registry: WorkflowRegistry::new(),
            executor_config: ExecutorConfig::default(),
            worker_config: WorkerPoolConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Use a specific store instead of a fresh in-memory one
    pub fn with_store(mut self, store: Arc<dyn WorkflowEventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_worker_config(mut self, config: WorkerPoolConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Default queue for runs and the queue the worker pool serves
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        let task_queue = task_queue.into();
        self.executor_config.default_task_queue = task_queue.clone();
        self.worker_config.task_queue = task_queue;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.worker_config = self.worker_config.with_max_concurrency(max);
        self
    }

    /// Register a workflow type
    pub fn register_workflow<W: Workflow>(mut self) -> Self {
        self.registry.register::<W>();
        self
    }

    /// Register a typed activity
    pub fn register_activity<A: Activity>(mut self, activity: A) -> Self {
        self.handlers
            .push((A::TYPE.to_string(), activity_handler(activity)));
        self
    }

    /// Register an activity handler closure
    pub fn register_handler<F, Fut>(mut self, activity_type: &str, handler: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler =
            Arc::new(move |ctx: ActivityContext, input: Value| -> HandlerFuture {
                Box::pin(handler(ctx, input))
            });
        self.handlers.push((activity_type.to_string(), handler));
        self
    }

    /// Wire the engine together; nothing runs until [`LocalEngine::start`]
    pub fn build(self) -> LocalEngine {
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryWorkflowEventStore::new()) as Arc<dyn WorkflowEventStore>
        });
        let executor = WorkflowExecutor::new(Arc::clone(&store), self.registry, self.executor_config);
        let pool = WorkerPool::new(Arc::clone(&store), executor.clone(), self.worker_config);
        for (activity_type, handler) in self.handlers {
            pool.insert_handler(&activity_type, handler);
        }

        LocalEngine {
            store,
            executor,
            pool,
        }
    }
}

impl Default for LocalEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine running inside this process
///
/// Owns the store, the executor and one worker pool. Hand out
/// [`LocalEngine::client`] to callers; call [`LocalEngine::shutdown`] on the
/// way out.
pub struct LocalEngine {
    store: Arc<dyn WorkflowEventStore>,
    executor: Arc<WorkflowExecutor>,
    pool: WorkerPool,
}

impl LocalEngine {
    pub fn builder() -> LocalEngineBuilder {
        LocalEngineBuilder::new()
    }

    /// Start executing activities
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        self.pool.start()?;
        info!(
            worker_id = self.pool.worker_id(),
            workflow_types = ?self.executor.registry().workflow_types(),
            "local engine started"
        );
        Ok(())
    }

    /// Drain the worker pool, then stop timers and run deadlines
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        let drained = self.pool.shutdown().await;
        self.executor.shutdown();
        info!("local engine stopped");
        drained
    }

    /// Caller-facing handle
    pub fn client(&self) -> Arc<dyn WorkflowClient> {
        self.executor.clone()
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.store
    }

    pub fn worker(&self) -> &WorkerPool {
        &self.pool
    }
}
