//! Reconciliation loop — re-probe every instance, then correct instance
//! counts toward each auto-scaling endpoint's `[min, max]` bounds.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use keel_balancer::CircuitBreakers;
use keel_health::probe_instances;
use keel_metrics::MetricsCollector;
use keel_rollout::{Orchestrator, OrchestratorResult};
use keel_state::{DeploymentEndpoint, InstanceId, InstanceStatus};

/// Reconciler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds between ticks.
    pub interval_secs: u64,
    /// Host for instances created by scale-up when the endpoint has none.
    pub scale_host: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            scale_host: "localhost".to_string(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub probed: usize,
    pub scaled_up: usize,
    pub scaled_down: usize,
}

/// Background loop that keeps health and instance counts current.
pub struct Reconciler {
    orchestrator: Orchestrator,
    metrics: Arc<MetricsCollector>,
    breakers: Option<Arc<CircuitBreakers>>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(orchestrator: Orchestrator, metrics: Arc<MetricsCollector>, config: ReconcileConfig) -> Self {
        Self {
            orchestrator,
            metrics,
            breakers: None,
            config,
        }
    }

    /// Drop breakers of instances removed by scale-down.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Run one pass: probe, scale, refresh metrics.
    pub async fn tick(&self) -> TickReport {
        let registry = self.orchestrator.registry();
        let probed = probe_instances(self.orchestrator.checker(), registry, registry.instances())
            .await
            .len();
        let mut report = TickReport {
            probed,
            ..TickReport::default()
        };

        for endpoint in registry.endpoints() {
            if !endpoint.auto_scaling {
                continue;
            }
            if self.orchestrator.is_deploying(&endpoint.endpoint_id) {
                debug!(endpoint = %endpoint.endpoint_id, "deployment in progress, not scaling");
                continue;
            }
            match self.scale(&endpoint) {
                Ok((up, down)) => {
                    report.scaled_up += up;
                    report.scaled_down += down;
                }
                Err(e) => warn!(endpoint = %endpoint.endpoint_id, error = %e, "scaling failed"),
            }
        }

        self.metrics.refresh().await;
        debug!(
            probed = report.probed,
            scaled_up = report.scaled_up,
            scaled_down = report.scaled_down,
            "reconcile tick complete"
        );
        report
    }

    /// Bring one endpoint back inside its bounds. Returns `(created, removed)`.
    ///
    /// The scale-up deficit is `min - (healthy + starting)`, not
    /// `min - healthy`: instances still booting count toward the floor so
    /// they are not duplicated every tick. Above the ceiling, the oldest
    /// healthy instances go first.
    fn scale(&self, endpoint: &DeploymentEndpoint) -> OrchestratorResult<(usize, usize)> {
        let registry = self.orchestrator.registry();
        let instances = registry.instances_for(&endpoint.endpoint_id);
        let healthy: Vec<&InstanceId> = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .map(|i| &i.instance_id)
            .collect();
        let starting = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Starting)
            .count();
        let min = endpoint.load_balancer.min_instances as usize;
        let max = endpoint.load_balancer.max_instances as usize;

        let coming_up = healthy.len() + starting;
        if coming_up < min {
            let host = instances
                .last()
                .map_or(self.config.scale_host.as_str(), |i| i.host.as_str());
            let deficit = min - coming_up;
            for _ in 0..deficit {
                self.orchestrator
                    .create_service_instance(&endpoint.endpoint_id, host, None)?;
            }
            info!(endpoint = %endpoint.endpoint_id, healthy = healthy.len(), starting, created = deficit, "scaled up");
            return Ok((deficit, 0));
        }

        if healthy.len() > max {
            let excess: Vec<InstanceId> = healthy[..healthy.len() - max].iter().map(|id| (*id).clone()).collect();
            let removed = registry.remove_instances(&excess)?;
            for inst in &removed {
                self.orchestrator.checker().forget(&inst.instance_id);
                if let Some(breakers) = &self.breakers {
                    breakers.remove(&inst.instance_id);
                }
            }
            info!(endpoint = %endpoint.endpoint_id, healthy = healthy.len(), removed = removed.len(), "scaled down");
            return Ok((0, removed.len()));
        }

        Ok((0, 0))
    }

    /// Tick every `interval` until `shutdown` fires.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(interval_secs = interval.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }
}
