//! Standalone regression tests.
//!
//! Drives the assembled API router the way the daemon wires it: registers
//! endpoints, creates instances, deploys, routes requests, and scrapes
//! metrics.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use tower::ServiceExt;

use keel_api::{ApiState, build_router};
use keel_balancer::{CircuitBreakers, Router};
use keel_health::{HealthCheckConfig, HealthChecker, Probe, ProbeFuture, ProbeOutcome};
use keel_metrics::MetricsCollector;
use keel_reconcile::{ReconcileConfig, Reconciler};
use keel_rollout::Orchestrator;
use keel_state::{Registry, ServiceInstance, StateStore};

struct AlwaysHealthy;

impl Probe for AlwaysHealthy {
    fn probe<'a>(&'a self, _: &'a ServiceInstance, _: &'a str, _: Duration) -> ProbeFuture<'a> {
        Box::pin(async { ProbeOutcome::healthy(json!({ "status": "ok", "cpu_usage": 12.5 })) })
    }
}

fn test_state(store: StateStore) -> ApiState {
    let registry = Registry::load(store).unwrap();
    let checker = Arc::new(HealthChecker::new(Arc::new(AlwaysHealthy), HealthCheckConfig::default()));
    let breakers = Arc::new(CircuitBreakers::default());
    ApiState {
        orchestrator: Orchestrator::new(registry.clone(), checker),
        router: Router::new(registry.clone(), breakers.clone()),
        metrics: Arc::new(MetricsCollector::new(registry).with_breakers(breakers)),
    }
}

fn endpoint_body() -> Value {
    json!({
        "endpoint_id": "api",
        "domain": "example.com",
        "subdomain": "api",
        "service_type": "web",
        "port": 8000,
        "load_balancer": { "strategy": "round_robin", "min_instances": 2, "max_instances": 4 },
        "auto_scaling": true,
        "deployment_strategy": "blue_green"
    })
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(req).await.unwrap()
}

async fn json_of(resp: Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn standalone_api_list_endpoints_empty() {
    let app = build_router(test_state(StateStore::open_in_memory().unwrap()));

    let resp = send(&app, "GET", "/api/v1/endpoints", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_of(resp).await["data"], json!([]));
}

#[tokio::test]
async fn standalone_api_unknown_routes_are_not_found() {
    let app = build_router(test_state(StateStore::open_in_memory().unwrap()));

    let resp = send(&app, "GET", "/api/v1/deployments/nope", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = send(&app, "POST", "/api/v1/deployments/nope/cancel", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = send(&app, "GET", "/api/v1/endpoints/nope/route", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_api_rejects_malformed_endpoint() {
    let app = build_router(test_state(StateStore::open_in_memory().unwrap()));

    let mut body = endpoint_body();
    body["load_balancer"]["strategy"] = json!("random");
    let resp = send(&app, "POST", "/api/v1/endpoints", Some(body)).await;
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn standalone_deploy_then_route_to_new_version() {
    let state = test_state(StateStore::open_in_memory().unwrap());
    let orchestrator = state.orchestrator.clone();
    let app = build_router(state);

    let resp = send(&app, "POST", "/api/v1/endpoints", Some(endpoint_body())).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    for _ in 0..2 {
        let resp = send(&app, "POST", "/api/v1/endpoints/api/instances", Some(json!({}))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    // Both instances are still starting.
    let resp = send(&app, "GET", "/api/v1/endpoints/api/route", None).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = send(&app, "POST", "/api/v1/endpoints/api/deploy", Some(json!({ "version": "v2" }))).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let id = json_of(resp).await["data"]["deployment_id"].as_str().unwrap().to_string();
    orchestrator.wait(&id).await.unwrap();

    let resp = send(&app, "GET", &format!("/api/v1/deployments/{id}"), None).await;
    let deployment = json_of(resp).await;
    assert_eq!(deployment["data"]["status"], "completed");
    assert_eq!(deployment["data"]["progress_percentage"], 100);

    let resp = send(&app, "GET", "/api/v1/endpoints/api", None).await;
    let status = json_of(resp).await;
    assert_eq!(status["data"]["route"]["stable_version"], "v2");
    assert_eq!(status["data"]["summary"]["total"], 2);
    assert_eq!(status["data"]["summary"]["healthy"], 2);

    let resp = send(&app, "GET", "/api/v1/endpoints/api/route", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let routed = json_of(resp).await;
    assert_eq!(routed["data"]["version"], "v2");
    let instance_id = routed["data"]["instance_id"].as_str().unwrap().to_string();

    let resp = send(
        &app,
        "POST",
        &format!("/api/v1/instances/{instance_id}/outcome"),
        Some(json!({ "success": true })),
    )
    .await;
    assert_eq!(json_of(resp).await["data"]["request_count"], 1);

    // Cancelling a finished deployment leaves it as it was.
    let resp = send(&app, "POST", &format!("/api/v1/deployments/{id}/cancel"), None).await;
    assert_eq!(json_of(resp).await["data"]["status"], "completed");
}

#[tokio::test]
async fn standalone_reconcile_then_scrape_metrics() {
    let state = test_state(StateStore::open_in_memory().unwrap());
    let reconciler = Reconciler::new(
        state.orchestrator.clone(),
        state.metrics.clone(),
        ReconcileConfig::default(),
    );
    let app = build_router(state);

    send(&app, "POST", "/api/v1/endpoints", Some(endpoint_body())).await;
    let report = reconciler.tick().await;
    assert_eq!(report.scaled_up, 2);

    let resp = send(&app, "GET", "/metrics", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("keel_instances{endpoint=\"api\"} 2\n"));
    assert!(text.contains("keel_instances_starting{endpoint=\"api\"} 2\n"));
    assert!(text.contains("keel_metrics_refreshes 1\n"));
}

#[tokio::test]
async fn standalone_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("keel.redb");

    let deployment_id = {
        let state = test_state(StateStore::open(&db_path).unwrap());
        let orchestrator = state.orchestrator.clone();
        let app = build_router(state);

        send(&app, "POST", "/api/v1/endpoints", Some(endpoint_body())).await;
        send(&app, "POST", "/api/v1/endpoints/api/instances", Some(json!({}))).await;
        let resp = send(&app, "POST", "/api/v1/endpoints/api/deploy", Some(json!({ "version": "v7" }))).await;
        let id = json_of(resp).await["data"]["deployment_id"].as_str().unwrap().to_string();
        orchestrator.wait(&id).await.unwrap();
        id
    };

    let app = build_router(test_state(StateStore::open(&db_path).unwrap()));

    let resp = send(&app, "GET", &format!("/api/v1/deployments/{deployment_id}"), None).await;
    assert_eq!(json_of(resp).await["data"]["status"], "completed");

    let resp = send(&app, "GET", "/api/v1/endpoints/api", None).await;
    let status = json_of(resp).await;
    assert_eq!(status["data"]["route"]["stable_version"], "v7");
    assert_eq!(status["data"]["summary"]["total"], 2);
    assert!(
        status["data"]["instances"]
            .as_array()
            .unwrap()
            .iter()
            .all(|i| i["version"] == "v7")
    );
}
