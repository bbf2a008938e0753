//! # Flowline server
//!
//! HTTP front door for the workflow catalog: runs the in-process engine and
//! exposes it under `/workflows`.

pub mod api;
pub mod config;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use flowline_durable::{LocalEngine, WorkflowClient};
use tower_http::trace::TraceLayer;

pub use api::AppState;
pub use config::ServerConfig;

/// Build the engine for `config` with the whole catalog registered
///
/// Nothing runs until [`LocalEngine::start`].
pub fn build_engine(config: &ServerConfig) -> LocalEngine {
    flowline_workflows::register_catalog(
        LocalEngine::builder()
            .with_task_queue(config.task_queue.clone())
            .with_max_concurrency(config.max_concurrent_activities),
        config.activity_latency(),
    )
    .build()
}

/// Full router with request tracing
pub fn app(client: Arc<dyn WorkflowClient>, config: &ServerConfig) -> Router {
    let state = AppState::new(
        client,
        config.default_workflow_type.clone(),
        config.status_max_wait,
    );
    api::routes(state).layer(TraceLayer::new_for_http())
}
