//! REST API handlers for deployments.
//!
//! Provides endpoints to start, list, get, and cancel deployments.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use keel_rollout::DeployConfig;

use crate::ApiState;
use crate::handlers::{ApiResponse, orchestrator_error};

/// Request body to start a deployment.
///
/// `strategy` overrides the endpoint's configured deployment strategy.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(flatten)]
    pub config: DeployConfig,
    #[serde(default)]
    pub strategy: Option<String>,
}

/// POST /api/v1/endpoints/:id/deploy
pub async fn deploy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DeployRequest>,
) -> Response {
    let started = state
        .orchestrator
        .deploy_service(&id, req.config, req.strategy.as_deref())
        .and_then(|deployment_id| state.orchestrator.get_deployment_status(&deployment_id));
    match started {
        Ok(status) => (StatusCode::ACCEPTED, ApiResponse::ok(status)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.list_deployments())
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_deployment_status(&id) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// POST /api/v1/deployments/:id/cancel
pub async fn cancel_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.cancel(&id) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => orchestrator_error(e),
    }
}
