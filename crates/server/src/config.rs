// Server configuration
//
// Every setting comes from the environment (a `.env` file is loaded first)
// and falls back to a default when unset or unparseable.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use flowline_durable::Workflow;
use flowline_workflows::{ActivityLatency, DelegationWorkflow, TASK_QUEUE};

/// Runtime settings for the front door and its engine
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Queue runs are started on
    pub task_queue: String,
    /// Workflow started when a request names none
    pub default_workflow_type: String,
    /// Activities executing at once in the worker pool
    pub max_concurrent_activities: usize,
    /// Upper bound on `waitMs` for status queries
    pub status_max_wait: Duration,
    /// Multiplier on simulated activity latency
    pub activity_latency_scale: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            task_queue: TASK_QUEUE.to_string(),
            default_workflow_type: DelegationWorkflow::TYPE.to_string(),
            max_concurrent_activities: 5,
            status_max_wait: Duration::from_secs(10),
            activity_latency_scale: 1.0,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables
    ///
    /// - `HOST`, `PORT`: listen address (default `0.0.0.0:8080`)
    /// - `TASK_QUEUE`: default `hello-world-queue`
    /// - `DEFAULT_WORKFLOW_TYPE`: default `WorkflowA`
    /// - `MAX_CONCURRENT_ACTIVITIES`: default 5
    /// - `STATUS_MAX_WAIT_MS`: default 10000
    /// - `ACTIVITY_LATENCY_SCALE`: default 1.0
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT").unwrap_or(defaults.port),
            task_queue: text("TASK_QUEUE").unwrap_or(defaults.task_queue),
            default_workflow_type: text("DEFAULT_WORKFLOW_TYPE")
                .unwrap_or(defaults.default_workflow_type),
            max_concurrent_activities: parse(&lookup, "MAX_CONCURRENT_ACTIVITIES")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.max_concurrent_activities),
            status_max_wait: parse(&lookup, "STATUS_MAX_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.status_max_wait),
            activity_latency_scale: parse(&lookup, "ACTIVITY_LATENCY_SCALE")
                .unwrap_or(defaults.activity_latency_scale),
        }
    }

    /// Socket address to bind
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr)
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", addr, e))
    }

    pub fn activity_latency(&self) -> ActivityLatency {
        ActivityLatency::scaled(self.activity_latency_scale)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
