//! keel-api — REST API for Keel.
//!
//! Provides axum route handlers for the inbound control operations:
//! endpoint registration, instance creation, deployments, and request
//! routing.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/endpoints` | List endpoints |
//! | POST | `/api/v1/endpoints` | Register an endpoint |
//! | GET | `/api/v1/endpoints/{id}` | Endpoint status (instances, route, summary) |
//! | POST | `/api/v1/endpoints/{id}/instances` | Create a service instance |
//! | POST | `/api/v1/endpoints/{id}/deploy` | Start a deployment |
//! | GET | `/api/v1/endpoints/{id}/route` | Pick an instance for one request |
//! | POST | `/api/v1/instances/{id}/outcome` | Record a request outcome |
//! | GET | `/api/v1/deployments` | List deployments |
//! | GET | `/api/v1/deployments/{id}` | Deployment status |
//! | POST | `/api/v1/deployments/{id}/cancel` | Cancel a deployment |
//! | GET | `/metrics` | Prometheus exposition |

pub mod deploy_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use keel_metrics::MetricsCollector;
use keel_rollout::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub router: keel_balancer::Router,
    pub metrics: Arc<MetricsCollector>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/endpoints", get(handlers::list_endpoints).post(handlers::register_endpoint))
        .route("/endpoints/{id}", get(handlers::get_endpoint))
        .route("/endpoints/{id}/instances", post(handlers::create_instance))
        .route("/endpoints/{id}/deploy", post(deploy_handlers::deploy))
        .route("/endpoints/{id}/route", get(handlers::route_request))
        .route("/instances/{id}/outcome", post(handlers::record_outcome))
        .route("/deployments", get(deploy_handlers::list_deployments))
        .route("/deployments/{id}", get(deploy_handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(deploy_handlers::cancel_deployment))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
