// Workflow HTTP routes
//
// Start, inspect and cancel runs through the engine client. Bodies are
// camelCase JSON; every failure is `{"error": <code>, "message": <detail>}`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use flowline_durable::{
    ExecutorError, RunDescription, StartWorkflowRequest, WorkflowClient, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

/// App state for workflow routes
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn WorkflowClient>,
    /// Type started when a request names none
    pub default_workflow_type: String,
    /// Cap on `waitMs`
    pub status_max_wait: Duration,
}

impl AppState {
    pub fn new(
        client: Arc<dyn WorkflowClient>,
        default_workflow_type: impl Into<String>,
        status_max_wait: Duration,
    ) -> Self {
        Self {
            client,
            default_workflow_type: default_workflow_type.into(),
            status_max_wait,
        }
    }
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workflows/start", post(start_workflow))
        .route("/workflows/status", get(workflow_status))
        .route("/workflows/cancel", post(cancel_workflow))
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        if e.is_invalid_request() {
            Self::InvalidRequest(e.to_string())
        } else if e.is_not_found() {
            Self::NotFound(e.to_string())
        } else if e.is_conflict() {
            Self::Conflict(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(format!("invalid request body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(format!("invalid query: {}", rejection.body_text()))
    }
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub workflow_id: Option<String>,
    pub run_id: Option<String>,
    /// Block up to this long for the run to close; 0 or absent answers at once
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_workflow_id: Option<String>,
}

impl From<RunDescription> for StatusResponse {
    fn from(run: RunDescription) -> Self {
        Self {
            workflow_id: run.workflow_id,
            run_id: run.run_id,
            workflow_type: run.workflow_type,
            status: run.status,
            result: run.result,
            error: run.error.map(|e| e.message),
            parent_workflow_id: run.parent_workflow_id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// POST /workflows/start
pub async fn start_workflow(
    State(state): State<AppState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(req) = body?;
    let workflow_id = required("workflowId", req.workflow_id)?;
    let workflow_type = req
        .workflow_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| state.default_workflow_type.clone());

    let handle = state
        .client
        .start_workflow(StartWorkflowRequest::new(
            workflow_type,
            workflow_id,
            req.input,
        ))
        .await
        .inspect_err(|e| warn!(error = %e, "failed to start workflow"))?;

    info!(
        workflow_id = %handle.workflow_id,
        run_id = %handle.run_id,
        workflow_type = %handle.workflow_type,
        "workflow started"
    );

    Ok(Json(StartResponse {
        workflow_id: handle.workflow_id,
        run_id: handle.run_id,
        workflow_type: handle.workflow_type,
        message: "Workflow started successfully".to_string(),
    }))
}

/// GET /workflows/status
pub async fn workflow_status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Query(query) = query?;
    let workflow_id = required("workflowId", query.workflow_id)?;
    let run_id = parse_run_id(query.run_id)?;

    let wait = Duration::from_millis(query.wait_ms.unwrap_or(0)).min(state.status_max_wait);
    let run = if wait.is_zero() {
        state.client.describe(&workflow_id, run_id).await?
    } else {
        state
            .client
            .wait_for_completion(&workflow_id, run_id, wait)
            .await?
    };

    Ok(Json(run.into()))
}

/// POST /workflows/cancel
pub async fn cancel_workflow(
    State(state): State<AppState>,
    body: Result<Json<CancelRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let Json(req) = body?;
    let workflow_id = required("workflowId", req.workflow_id)?;
    let run_id = parse_run_id(req.run_id)?;
    let reason = req
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled via API".to_string());

    let handle = state
        .client
        .cancel_workflow(&workflow_id, run_id, &reason)
        .await?;

    info!(
        workflow_id = %handle.workflow_id,
        run_id = %handle.run_id,
        reason = %reason,
        "workflow cancellation requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            workflow_id: handle.workflow_id,
            run_id: handle.run_id,
            message: "Workflow cancellation requested".to_string(),
        }),
    ))
}

fn required(field: &str, value: Option<String>) -> Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest(format!("{} is required", field)))
}

fn parse_run_id(run_id: Option<String>) -> Result<Option<Uuid>, ApiError> {
    match run_id.filter(|r| !r.trim().is_empty()) {
        Some(raw) => Uuid::parse_str(raw.trim())
            .map(Some)
            .map_err(|e| ApiError::InvalidRequest(format!("invalid runId {}: {}", raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_durable::engine::RegistryError;
    use flowline_durable::StoreError;

    #[test]
    fn test_executor_errors_map_to_status_codes() {
        let cases = [
            (
                ExecutorError::Registry(RegistryError::UnknownWorkflowType("Nope".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ExecutorError::Store(StoreError::WorkflowNotFound("wf".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ExecutorError::RunClosed {
                    workflow_id: "wf".into(),
                    run_id: Uuid::now_v7(),
                },
                StatusCode::CONFLICT,
            ),
            (ExecutorError::ShuttingDown, StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_required_rejects_blank() {
        assert!(required("workflowId", None).is_err());
        assert!(required("workflowId", Some("  ".into())).is_err());
        assert_eq!(required("workflowId", Some("wf-1".into())).unwrap(), "wf-1");
    }

    #[test]
    fn test_parse_run_id() {
        assert_eq!(parse_run_id(None).unwrap(), None);
        assert_eq!(parse_run_id(Some(String::new())).unwrap(), None);
        let id = Uuid::now_v7();
        assert_eq!(parse_run_id(Some(id.to_string())).unwrap(), Some(id));
        assert!(matches!(
            parse_run_id(Some("not-a-uuid".into())),
            Err(ApiError::InvalidRequest(_))
        ));
    }
}
