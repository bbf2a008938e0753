//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - claims activity tasks and runs them concurrently
//! - [`ActivityOutcomeSink`] - where results and failures are reported
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   Poll loop (task notify / next due / interval)     │    │
//! │  └──────────────────────────┬──────────────────────────┘    │
//! │                             ▼                                │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Task Executor (Semaphore-limited)           │    │
//! │  │  [Task 1] [Task 2] ... [Task N]                     │    │
//! │  │  start-to-close timeout + cancellation token        │    │
//! │  └──────────────────────────┬──────────────────────────┘    │
//! │                             ▼                                │
//! │        store (complete / fail) → ActivityOutcomeSink        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use flowline_durable::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::new("orders").with_max_concurrency(20);
//! let pool = WorkerPool::new(store, executor, config);
//!
//! pool.register_handler("process_order", |_ctx, input| async move {
//!     // Process the order...
//!     Ok(json!({"status": "completed", "order": input}))
//! });
//!
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod pool;

pub use pool::{
    activity_handler, ActivityHandler, ActivityOutcomeSink, HandlerFuture, WorkerPool,
    WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
