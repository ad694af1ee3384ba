//! REST API handlers for endpoints, instances, and request routing.
//!
//! Each handler goes through the orchestrator or the request router and
//! returns JSON in the `{ success, data, error }` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::error;

use keel_balancer::RoutingError;
use keel_rollout::OrchestratorError;
use keel_state::{DeploymentEndpoint, StateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn orchestrator_error(e: OrchestratorError) -> Response {
    let status = match &e {
        OrchestratorError::UnknownEndpoint(_) | OrchestratorError::UnknownDeployment(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::UnknownStrategy(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::AlreadyDeploying { .. } => StatusCode::CONFLICT,
        OrchestratorError::State(inner) => state_status(inner),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "orchestrator request failed");
    }
    error_response(&e.to_string(), status)
}

fn routing_error(e: RoutingError) -> Response {
    let status = match &e {
        RoutingError::NoAvailableInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
        RoutingError::UnknownEndpoint(_) | RoutingError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        RoutingError::State(inner) => state_status(inner),
    };
    error_response(&e.to_string(), status)
}

// ── Endpoints ──────────────────────────────────────────────────

/// GET /api/v1/endpoints
pub async fn list_endpoints(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.list_endpoints())
}

/// POST /api/v1/endpoints
pub async fn register_endpoint(
    State(state): State<ApiState>,
    Json(endpoint): Json<DeploymentEndpoint>,
) -> Response {
    let lb = &endpoint.load_balancer;
    if lb.min_instances > lb.max_instances {
        return error_response(
            &format!(
                "min_instances {} exceeds max_instances {}",
                lb.min_instances, lb.max_instances
            ),
            StatusCode::BAD_REQUEST,
        );
    }
    match state.orchestrator.registry().register_endpoint(endpoint.clone()) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(endpoint)).into_response(),
        Err(e) => error_response(&e.to_string(), state_status(&e)),
    }
}

/// GET /api/v1/endpoints/:id
pub async fn get_endpoint(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_endpoint_status(&id) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// Instance creation request body.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_host() -> String {
    "localhost".to_string()
}

/// POST /api/v1/endpoints/:id/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<CreateInstanceRequest>,
) -> Response {
    match state.orchestrator.create_service_instance(&id, &req.host, req.port) {
        Ok(instance) => (StatusCode::CREATED, ApiResponse::ok(instance)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

// ── Routing ────────────────────────────────────────────────────

/// GET /api/v1/endpoints/:id/route
pub async fn route_request(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.router.route(&id) {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => routing_error(e),
    }
}

/// Outcome of a request previously routed to an instance.
#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub success: bool,
}

/// POST /api/v1/instances/:id/outcome
pub async fn record_outcome(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<OutcomeRequest>,
) -> Response {
    match state.router.record_outcome(&id, req.success) {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => routing_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = keel_metrics::render_prometheus(&state.metrics.snapshot().await);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::to_bytes;
    use keel_balancer::CircuitBreakers;
    use keel_health::{HealthCheckConfig, HealthChecker, Probe, ProbeFuture, ProbeOutcome};
    use keel_metrics::MetricsCollector;
    use keel_rollout::Orchestrator;
    use keel_state::{
        DeploymentStrategy, InstanceStatus, LoadBalancerConfig, LoadBalancingStrategy, Registry,
        ServiceInstance, StateStore,
    };
    use serde_json::Value;

    struct AlwaysHealthy;

    impl Probe for AlwaysHealthy {
        fn probe<'a>(&'a self, _: &'a ServiceInstance, _: &'a str, _: Duration) -> ProbeFuture<'a> {
            Box::pin(async { ProbeOutcome::healthy(serde_json::json!({ "status": "ok" })) })
        }
    }

    pub(crate) fn test_state() -> ApiState {
        let registry = Registry::new(StateStore::open_in_memory().unwrap());
        let checker = Arc::new(HealthChecker::new(Arc::new(AlwaysHealthy), HealthCheckConfig::default()));
        let breakers = Arc::new(CircuitBreakers::default());
        ApiState {
            orchestrator: Orchestrator::new(registry.clone(), checker),
            router: keel_balancer::Router::new(registry.clone(), breakers.clone()),
            metrics: Arc::new(MetricsCollector::new(registry).with_breakers(breakers)),
        }
    }

    pub(crate) fn test_endpoint(id: &str) -> DeploymentEndpoint {
        DeploymentEndpoint {
            endpoint_id: id.to_string(),
            domain: "example.com".to_string(),
            subdomain: Some("api".to_string()),
            service_type: "web".to_string(),
            port: 8000,
            health_check_path: "/health".to_string(),
            load_balancer: LoadBalancerConfig {
                strategy: LoadBalancingStrategy::RoundRobin,
                min_instances: 1,
                max_instances: 4,
            },
            ssl_enabled: false,
            auto_scaling: false,
            circuit_breaker_enabled: true,
            deployment_strategy: DeploymentStrategy::BlueGreen,
        }
    }

    pub(crate) async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn list_endpoints_empty() {
        let resp = list_endpoints(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn register_and_get_endpoint() {
        let state = test_state();
        let resp = register_endpoint(State(state.clone()), Json(test_endpoint("api"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_endpoint(State(state), Path("api".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["route"]["stable_version"], "initial");
        assert_eq!(body["data"]["summary"]["total"], 0);
    }

    #[tokio::test]
    async fn register_rejects_inverted_bounds() {
        let mut endpoint = test_endpoint("api");
        endpoint.load_balancer.min_instances = 5;
        endpoint.load_balancer.max_instances = 2;
        let resp = register_endpoint(State(test_state()), Json(endpoint)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_nonexistent_endpoint() {
        let resp = get_endpoint(State(test_state()), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn create_instance_assigns_next_port() {
        let state = test_state();
        state.orchestrator.registry().register_endpoint(test_endpoint("api")).unwrap();
        let req = || CreateInstanceRequest { host: "localhost".to_string(), port: None };

        let first = create_instance(State(state.clone()), Path("api".to_string()), Json(req())).await;
        assert_eq!(first.status(), StatusCode::CREATED);
        let second = create_instance(State(state), Path("api".to_string()), Json(req())).await;
        let body = body_json(second).await;
        assert_eq!(body["data"]["port"], 8002);
        assert_eq!(body["data"]["status"], "starting");
    }

    #[tokio::test]
    async fn create_instance_for_unknown_endpoint() {
        let req = CreateInstanceRequest { host: "localhost".to_string(), port: Some(9000) };
        let resp = create_instance(State(test_state()), Path("nope".to_string()), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn route_without_healthy_instances_is_unavailable() {
        let state = test_state();
        state.orchestrator.registry().register_endpoint(test_endpoint("api")).unwrap();
        state.orchestrator.create_service_instance("api", "localhost", None).unwrap();

        let resp = route_request(State(state), Path("api".to_string())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn route_and_record_outcome() {
        let state = test_state();
        let registry = state.orchestrator.registry().clone();
        registry.register_endpoint(test_endpoint("api")).unwrap();
        let instance = state.orchestrator.create_service_instance("api", "localhost", None).unwrap();
        registry
            .update_instance(&instance.instance_id, |i| i.status = InstanceStatus::Healthy)
            .unwrap();

        let resp = route_request(State(state.clone()), Path("api".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["instance_id"], instance.instance_id.as_str());

        let resp = record_outcome(
            State(state),
            Path(instance.instance_id.clone()),
            Json(OutcomeRequest { success: false }),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["data"]["request_count"], 1);
        assert_eq!(body["data"]["error_count"], 1);
    }

    #[tokio::test]
    async fn outcome_for_unknown_instance() {
        let resp = record_outcome(
            State(test_state()),
            Path("missing".to_string()),
            Json(OutcomeRequest { success: true }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        state.orchestrator.registry().register_endpoint(test_endpoint("api")).unwrap();
        state.metrics.refresh().await;

        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("keel_instances{endpoint=\"api\"} 0"));
    }
}
