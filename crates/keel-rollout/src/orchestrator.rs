//! Deployment orchestrator — the inbound control operations.
//!
//! The orchestrator validates requests, persists a `planning` record, and
//! spawns each deployment as an independent task. Deployments never share
//! state with each other except through the [`Registry`], so one failing
//! deployment cannot affect another or the reconciliation loop.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use keel_balancer::CircuitBreakers;
use keel_health::HealthChecker;
use keel_state::{
    DeploymentEndpoint, DeploymentId, DeploymentStatus, DeploymentStrategy, EndpointId,
    InstanceStatus, Registry, ServiceInstance, TrafficRoute,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::executor::Execution;
use crate::strategy::DeployConfig;

/// Per-status instance counts for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub total: usize,
    pub healthy: usize,
    pub starting: usize,
    pub unhealthy: usize,
    pub stopping: usize,
    pub average_health_score: f64,
}

impl InstanceSummary {
    pub fn of(instances: &[ServiceInstance]) -> Self {
        let mut summary = Self {
            total: instances.len(),
            ..Self::default()
        };
        for inst in instances {
            match inst.status {
                InstanceStatus::Healthy => summary.healthy += 1,
                InstanceStatus::Starting => summary.starting += 1,
                InstanceStatus::Unhealthy => summary.unhealthy += 1,
                InstanceStatus::Stopping => summary.stopping += 1,
            }
        }
        if !instances.is_empty() {
            summary.average_health_score =
                instances.iter().map(|i| i.health_score).sum::<f64>() / instances.len() as f64;
        }
        summary
    }
}

/// Full view of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub endpoint: DeploymentEndpoint,
    pub instances: Vec<ServiceInstance>,
    pub route: TrafficRoute,
    pub summary: InstanceSummary,
}

struct Running {
    endpoint_id: EndpointId,
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
    /// Flips to `true` once the task has recorded its outcome.
    done: watch::Receiver<bool>,
}

impl Running {
    fn is_finished(&self) -> bool {
        *self.done.borrow() || self.handle.is_finished()
    }
}

struct Inner {
    registry: Registry,
    checker: Arc<HealthChecker>,
    running: Mutex<HashMap<DeploymentId, Running>>,
}

/// Starts, tracks, and cancels deployments.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
    breakers: Option<Arc<CircuitBreakers>>,
}

impl Orchestrator {
    pub fn new(registry: Registry, checker: Arc<HealthChecker>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                checker,
                running: Mutex::new(HashMap::new()),
            }),
            breakers: None,
        }
    }

    /// Drop breakers of instances retired by deployments.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.inner.checker
    }

    fn running(&self) -> MutexGuard<'_, HashMap<DeploymentId, Running>> {
        self.inner.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Create a `starting` instance running the endpoint's stable version.
    ///
    /// Without an explicit port, the lowest free port above the endpoint's
    /// base port on `host` is used.
    pub fn create_service_instance(
        &self,
        endpoint_id: &str,
        host: &str,
        port: Option<u16>,
    ) -> OrchestratorResult<ServiceInstance> {
        let endpoint = self.endpoint(endpoint_id)?;
        let port = match port {
            Some(p) => p,
            None => free_ports(&self.inner.registry, endpoint_id, host, endpoint.port.saturating_add(1), 1)
                .first()
                .copied()
                .unwrap_or(endpoint.port),
        };
        let version = self.inner.registry.route(endpoint_id).stable_version;
        let instance = ServiceInstance::new(endpoint_id, host, port, &version);
        self.inner.registry.insert_instance(instance.clone())?;
        info!(
            instance_id = %instance.instance_id,
            endpoint = %endpoint_id,
            address = %instance.address(),
            "service instance created"
        );
        Ok(instance)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Start rolling `config.version` out to an endpoint.
    ///
    /// `strategy` overrides the endpoint's configured strategy. Returns as
    /// soon as the deployment is recorded; progress is read back through
    /// [`get_deployment_status`](Self::get_deployment_status).
    pub fn deploy_service(
        &self,
        endpoint_id: &str,
        config: DeployConfig,
        strategy: Option<&str>,
    ) -> OrchestratorResult<DeploymentId> {
        let endpoint = self.endpoint(endpoint_id)?;
        let strategy: DeploymentStrategy = match strategy {
            Some(s) => s.parse()?,
            None => endpoint.deployment_strategy,
        };

        let mut running = self.running();
        running.retain(|_, r| !r.is_finished());
        if let Some((id, _)) = running.iter().find(|(_, r)| r.endpoint_id == endpoint_id) {
            return Err(OrchestratorError::AlreadyDeploying {
                endpoint: endpoint_id.to_string(),
                deployment: id.clone(),
            });
        }

        let current = self.inner.registry.route(endpoint_id).stable_version;
        let status = DeploymentStatus::new(endpoint_id, strategy, Some(current), &config.version);
        let deployment_id = status.deployment_id.clone();
        self.inner.registry.insert_deployment(status)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let execution = Execution {
            registry: self.inner.registry.clone(),
            checker: self.inner.checker.clone(),
            endpoint,
            deployment_id: deployment_id.clone(),
            breakers: self.breakers.clone(),
            config,
            cancel: cancel_rx,
        };
        let (done_tx, done_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            execution.run(strategy).await;
            let _ = done_tx.send(true);
        });
        running.insert(
            deployment_id.clone(),
            Running {
                endpoint_id: endpoint_id.to_string(),
                handle,
                cancel: cancel_tx,
                done: done_rx,
            },
        );
        Ok(deployment_id)
    }

    /// Wait for a deployment task to finish and return its final record.
    ///
    /// Dropping the returned future leaves the deployment untouched.
    pub async fn wait(&self, deployment_id: &str) -> OrchestratorResult<DeploymentStatus> {
        let done = self.running().get(deployment_id).map(|r| r.done.clone());
        if let Some(mut done) = done {
            if done.wait_for(|finished| *finished).await.is_err() {
                warn!(deployment = %deployment_id, "deployment task aborted");
            }
            self.running().remove(deployment_id);
        }
        self.get_deployment_status(deployment_id)
    }

    /// Request cooperative cancellation of a deployment.
    ///
    /// A running deployment stops at its next checkpoint and ends `failed`.
    /// A non-terminal record with no task behind it (left over from an
    /// earlier process) is marked failed directly.
    pub fn cancel(&self, deployment_id: &str) -> OrchestratorResult<DeploymentStatus> {
        let current = self.get_deployment_status(deployment_id)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let signalled = match self.running().get(deployment_id) {
            Some(r) => r.cancel.send(true).is_ok(),
            None => false,
        };
        if signalled {
            info!(deployment = %deployment_id, "deployment cancellation requested");
            return Ok(current);
        }

        warn!(deployment = %deployment_id, "cancelling orphaned deployment");
        self.inner
            .registry
            .update_deployment(deployment_id, |d| d.fail(OrchestratorError::Cancelled.to_string()))?
            .ok_or_else(|| OrchestratorError::UnknownDeployment(deployment_id.to_string()))
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Whether a deployment task for `endpoint_id` is still running.
    pub fn is_deploying(&self, endpoint_id: &str) -> bool {
        self.running()
            .values()
            .any(|r| r.endpoint_id == endpoint_id && !r.is_finished())
    }

    pub fn get_deployment_status(&self, deployment_id: &str) -> OrchestratorResult<DeploymentStatus> {
        self.inner
            .registry
            .deployment(deployment_id)
            .ok_or_else(|| OrchestratorError::UnknownDeployment(deployment_id.to_string()))
    }

    pub fn get_endpoint_status(&self, endpoint_id: &str) -> OrchestratorResult<EndpointStatus> {
        let endpoint = self.endpoint(endpoint_id)?;
        let instances = self.inner.registry.instances_for(endpoint_id);
        Ok(EndpointStatus {
            summary: InstanceSummary::of(&instances),
            route: self.inner.registry.route(endpoint_id),
            endpoint,
            instances,
        })
    }

    pub fn list_endpoints(&self) -> Vec<DeploymentEndpoint> {
        self.inner.registry.endpoints()
    }

    pub fn list_deployments(&self) -> Vec<DeploymentStatus> {
        self.inner.registry.deployments()
    }

    fn endpoint(&self, endpoint_id: &str) -> OrchestratorResult<DeploymentEndpoint> {
        self.inner
            .registry
            .endpoint(endpoint_id)
            .ok_or_else(|| OrchestratorError::UnknownEndpoint(endpoint_id.to_string()))
    }
}

/// Up to `count` ports from `first` upwards not taken by the endpoint's
/// instances on `host`.
pub(crate) fn free_ports(
    registry: &Registry,
    endpoint_id: &str,
    host: &str,
    first: u16,
    count: usize,
) -> Vec<u16> {
    let taken: HashSet<u16> = registry
        .instances_for(endpoint_id)
        .into_iter()
        .filter(|i| i.host == host)
        .map(|i| i.port)
        .collect();
    (first..=u16::MAX).filter(|p| !taken.contains(p)).take(count).collect()
}
