// Flowline server
// Decision: The engine runs in-process; the router only sees its client
// Decision: The engine is shut down on every exit path, including failed serve

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use flowline_durable::WorkflowClient;
use flowline_server::telemetry::{init_telemetry, TelemetryConfig};
use flowline_server::{app, build_engine, ServerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    init_telemetry(&TelemetryConfig::from_env());

    let config = ServerConfig::from_env();
    let addr = config.listen_addr()?;
    info!(
        addr = %addr,
        task_queue = %config.task_queue,
        default_workflow_type = %config.default_workflow_type,
        max_concurrent_activities = config.max_concurrent_activities,
        "starting flowline server"
    );

    let engine = build_engine(&config);
    engine.start().context("failed to start workflow engine")?;

    let served = serve(&config, engine.client(), addr).await;

    info!("shutting down workflow engine");
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "workflow engine did not shut down cleanly");
    }
    served
}

async fn serve(
    config: &ServerConfig,
    client: Arc<dyn WorkflowClient>,
    addr: SocketAddr,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app(client, config))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
