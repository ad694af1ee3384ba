//! Metrics collector — aggregates fleet health from the registry.
//!
//! The reconciliation loop calls [`MetricsCollector::refresh`] once per
//! tick; readers get the last computed [`FleetMetrics`] without touching
//! the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use keel_balancer::CircuitBreakers;
use keel_state::{DeploymentState, InstanceStatus, Registry, ServiceInstance, epoch_secs};

/// Aggregates for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointMetrics {
    pub endpoint_id: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub starting_instances: usize,
    pub unhealthy_instances: usize,
    pub average_health_score: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_cpu_usage: f64,
    pub average_memory_usage: f64,
}

impl EndpointMetrics {
    fn from_instances(endpoint_id: &str, instances: &[ServiceInstance]) -> Self {
        let count = |status: InstanceStatus| instances.iter().filter(|i| i.status == status).count();
        let mean = |f: fn(&ServiceInstance) -> f64| {
            if instances.is_empty() {
                0.0
            } else {
                instances.iter().map(f).sum::<f64>() / instances.len() as f64
            }
        };
        let request_count: u64 = instances.iter().map(|i| i.request_count).sum();
        let error_count: u64 = instances.iter().map(|i| i.error_count).sum();

        Self {
            endpoint_id: endpoint_id.to_string(),
            total_instances: instances.len(),
            healthy_instances: count(InstanceStatus::Healthy),
            starting_instances: count(InstanceStatus::Starting),
            unhealthy_instances: count(InstanceStatus::Unhealthy),
            average_health_score: mean(|i| i.health_score),
            request_count,
            error_count,
            error_rate: if request_count == 0 {
                0.0
            } else {
                error_count as f64 / request_count as f64
            },
            average_cpu_usage: mean(|i| i.cpu_usage),
            average_memory_usage: mean(|i| i.memory_usage),
        }
    }
}

/// Fleet-wide aggregates, recomputed every reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetMetrics {
    pub endpoints: Vec<EndpointMetrics>,
    pub deployments_in_progress: usize,
    pub deployments_completed: usize,
    pub deployments_failed: usize,
    pub open_circuits: usize,
    /// Completed refreshes since startup.
    pub refreshes: u64,
    /// Unix timestamp (seconds) of the last refresh.
    pub updated_at: u64,
}

impl FleetMetrics {
    pub fn total_instances(&self) -> usize {
        self.endpoints.iter().map(|e| e.total_instances).sum()
    }

    pub fn healthy_instances(&self) -> usize {
        self.endpoints.iter().map(|e| e.healthy_instances).sum()
    }
}

/// Computes and caches [`FleetMetrics`].
pub struct MetricsCollector {
    registry: Registry,
    breakers: Option<Arc<CircuitBreakers>>,
    latest: RwLock<FleetMetrics>,
    refreshes: AtomicU64,
}

impl MetricsCollector {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            breakers: None,
            latest: RwLock::new(FleetMetrics::default()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Also report open circuit breakers.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Recompute fleet metrics from the registry.
    pub async fn refresh(&self) -> FleetMetrics {
        let endpoints = self
            .registry
            .endpoints()
            .iter()
            .map(|e| {
                let instances = self.registry.instances_for(&e.endpoint_id);
                EndpointMetrics::from_instances(&e.endpoint_id, &instances)
            })
            .collect();

        let deployments = self.registry.deployments();
        let in_state = |state: DeploymentState| deployments.iter().filter(|d| d.status == state).count();

        let metrics = FleetMetrics {
            endpoints,
            deployments_in_progress: deployments.iter().filter(|d| !d.is_terminal()).count(),
            deployments_completed: in_state(DeploymentState::Completed),
            deployments_failed: in_state(DeploymentState::Failed),
            open_circuits: self.breakers.as_ref().map_or(0, |b| b.open_count()),
            refreshes: self.refreshes.fetch_add(1, Ordering::Relaxed) + 1,
            updated_at: epoch_secs(),
        };

        debug!(
            endpoints = metrics.endpoints.len(),
            instances = metrics.total_instances(),
            healthy = metrics.healthy_instances(),
            "fleet metrics refreshed"
        );
        *self.latest.write().await = metrics.clone();
        metrics
    }

    /// The most recent refresh result.
    pub async fn snapshot(&self) -> FleetMetrics {
        self.latest.read().await.clone()
    }
}
