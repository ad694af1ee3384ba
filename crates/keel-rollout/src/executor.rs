//! Strategy execution for a single deployment.
//!
//! An [`Execution`] owns one deployment from `planning` to a terminal
//! state. It runs as its own tokio task. Every registry read it acts on is
//! re-read after each suspension point, and it checks for cancellation at
//! every checkpoint.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use keel_balancer::CircuitBreakers;
use keel_health::{HealthChecker, probe_instances};
use keel_state::{
    DeploymentEndpoint, DeploymentId, DeploymentStatus, DeploymentStrategy, InstanceId,
    InstanceStatus, Registry, ServiceInstance,
};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::strategy::{CanaryConfig, DeployConfig, secs};

pub(crate) struct Execution {
    pub(crate) registry: Registry,
    pub(crate) checker: Arc<HealthChecker>,
    pub(crate) breakers: Option<Arc<CircuitBreakers>>,
    pub(crate) endpoint: DeploymentEndpoint,
    pub(crate) deployment_id: DeploymentId,
    pub(crate) config: DeployConfig,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl Execution {
    /// Drive the deployment to a terminal state. Never panics on failure:
    /// errors are recorded on the deployment record.
    pub(crate) async fn run(mut self, strategy: DeploymentStrategy) {
        info!(
            deployment = %self.deployment_id,
            endpoint = %self.endpoint.endpoint_id,
            %strategy,
            version = %self.config.version,
            "deployment started"
        );

        let result = match self.update(|d| d.begin()) {
            Ok(()) => match strategy {
                DeploymentStrategy::BlueGreen => self.blue_green().await,
                DeploymentStrategy::Rolling => self.rolling().await,
                DeploymentStrategy::Canary => self.canary().await,
            },
            Err(e) => Err(e),
        };

        let recorded = match result {
            Ok(()) => {
                info!(deployment = %self.deployment_id, "deployment completed");
                self.update(|d| d.complete())
            }
            Err(e) => {
                warn!(deployment = %self.deployment_id, error = %e, "deployment failed");
                self.update(|d| d.fail(e.to_string()))
            }
        };
        if let Err(e) = recorded {
            error!(deployment = %self.deployment_id, error = %e, "failed to record deployment outcome");
        }
    }

    // ── Blue-green ─────────────────────────────────────────────────

    async fn blue_green(&mut self) -> OrchestratorResult<()> {
        let cfg = self.config.blue_green.clone();
        let existing = self.registry.instances_for(&self.endpoint.endpoint_id).len();
        let count = self.target_count(existing);

        let base = self.endpoint.port.saturating_add(cfg.port_offset);
        let green = self.spawn_instances(count, base)?;
        info!(deployment = %self.deployment_id, green = green.len(), "green instances created");
        self.progress(25)?;

        self.wait_healthy(&green, secs(cfg.timeout_secs), secs(cfg.poll_interval_secs))
            .await?;
        self.progress(75)?;
        self.checkpoint()?;

        // Blue is everything that is not green at the moment of the switch.
        let green_set: HashSet<&InstanceId> = green.iter().collect();
        let blue: Vec<InstanceId> = self
            .registry
            .instances_for(&self.endpoint.endpoint_id)
            .into_iter()
            .map(|i| i.instance_id)
            .filter(|id| !green_set.contains(id))
            .collect();
        self.retire_and_switch(&blue)
    }

    // ── Rolling ────────────────────────────────────────────────────

    async fn rolling(&mut self) -> OrchestratorResult<()> {
        let cfg = self.config.rolling.clone();
        let timeout = secs(cfg.health_timeout_secs);
        let poll = secs(cfg.poll_interval_secs);
        let endpoint_id = self.endpoint.endpoint_id.clone();
        let version = self.config.version.clone();

        let old: Vec<ServiceInstance> = self
            .registry
            .instances_for(&endpoint_id)
            .into_iter()
            .filter(|i| i.version != version)
            .collect();

        if old.is_empty() {
            // Nothing to replace: bring the endpoint up at the target size.
            let running = self.registry.instances_for(&endpoint_id).len();
            let count = self.target_count(running).saturating_sub(running);
            let fresh = self.spawn_instances(count, self.endpoint.port.saturating_add(1))?;
            self.progress(50)?;
            self.wait_healthy(&fresh, timeout, poll).await?;
            return self.retire_and_switch(&[]);
        }

        self.registry.update_route(&endpoint_id, |r| {
            r.canary_version = Some(version.clone());
            r.canary_percent = 0;
        });

        let total = old.len();
        for (n, retiring) in old.iter().enumerate() {
            self.checkpoint()?;
            let surge = self.spawn_instances(1, self.endpoint.port.saturating_add(1))?;
            self.wait_healthy(&surge, timeout, poll).await?;

            self.ensure_removable(&retiring.instance_id)?;
            let share = ((n + 1) * 100 / total) as u8;
            self.registry.update_route(&endpoint_id, |r| r.canary_percent = share);
            self.registry.remove_instances(std::slice::from_ref(&retiring.instance_id))?;
            self.discard(&retiring.instance_id);
            debug!(
                deployment = %self.deployment_id,
                replaced = %retiring.instance_id,
                step = n + 1,
                total,
                "instance replaced"
            );
            self.progress(share.min(99))?;
        }

        self.retire_and_switch(&[])
    }

    /// Removing `instance_id` must not drop the endpoint's healthy count
    /// below `min_instances`.
    fn ensure_removable(&self, instance_id: &str) -> OrchestratorResult<()> {
        let current = self.registry.instances_for(&self.endpoint.endpoint_id);
        let Some(target) = current.iter().find(|i| i.instance_id == instance_id) else {
            return Ok(());
        };
        if target.status != InstanceStatus::Healthy {
            return Ok(());
        }
        let healthy = current.iter().filter(|i| i.status == InstanceStatus::Healthy).count();
        let min = self.endpoint.load_balancer.min_instances;
        if healthy.saturating_sub(1) < min as usize {
            return Err(OrchestratorError::BelowMinimum {
                instance: instance_id.to_string(),
                healthy: healthy - 1,
                min,
            });
        }
        Ok(())
    }

    // ── Canary ─────────────────────────────────────────────────────

    async fn canary(&mut self) -> OrchestratorResult<()> {
        let endpoint_id = self.endpoint.endpoint_id.clone();
        let version = self.config.version.clone();
        self.registry.update_route(&endpoint_id, |r| {
            r.canary_version = Some(version);
            r.canary_percent = 0;
        });

        let result = self.canary_steps().await;
        if result.is_err() {
            self.registry.update_route(&endpoint_id, |r| {
                r.canary_version = None;
                r.canary_percent = 0;
            });
            warn!(deployment = %self.deployment_id, "canary aborted, traffic left on stable version");
        }
        result
    }

    async fn canary_steps(&mut self) -> OrchestratorResult<()> {
        let cfg = self.config.canary.clone();
        let endpoint_id = self.endpoint.endpoint_id.clone();
        let stable = self
            .registry
            .instances_for(&endpoint_id)
            .iter()
            .filter(|i| i.version != self.config.version)
            .count();
        let total = self.target_count(stable);

        let mut canaries: Vec<InstanceId> = Vec::new();
        for percent in cfg.steps() {
            self.checkpoint()?;
            let wanted = (total * percent as usize).div_ceil(100).max(1);
            if wanted > canaries.len() {
                let more =
                    self.spawn_instances(wanted - canaries.len(), self.endpoint.port.saturating_add(1))?;
                canaries.extend(more);
                self.wait_healthy(
                    &canaries,
                    secs(cfg.health_timeout_secs),
                    secs(cfg.poll_interval_secs),
                )
                .await?;
            }

            self.registry.update_route(&endpoint_id, |r| r.canary_percent = percent);
            self.progress(percent.min(99))?;
            info!(
                deployment = %self.deployment_id,
                percent,
                canaries = canaries.len(),
                "canary checkpoint reached"
            );

            if percent < 100 {
                self.observe(&canaries, percent, &cfg).await?;
            }
        }

        let promoted: HashSet<&InstanceId> = canaries.iter().collect();
        let stable: Vec<InstanceId> = self
            .registry
            .instances_for(&endpoint_id)
            .into_iter()
            .map(|i| i.instance_id)
            .filter(|id| !promoted.contains(id))
            .collect();
        self.retire_and_switch(&stable)
    }

    /// Watch the canary set for `observation_secs`, probing every poll
    /// interval, then judge the checkpoint.
    async fn observe(&mut self, canaries: &[InstanceId], percent: u8, cfg: &CanaryConfig) -> OrchestratorResult<()> {
        let poll = secs(cfg.poll_interval_secs);
        let deadline = Instant::now() + secs(cfg.observation_secs);
        let mut samples = 0usize;
        let mut passed = 0usize;

        loop {
            let now = Instant::now();
            if now < deadline {
                self.pause(poll.min(deadline - now)).await?;
            }
            let probed = self.probe(canaries).await?;
            samples += probed.len();
            passed += probed.iter().filter(|i| i.status == InstanceStatus::Healthy).count();
            if Instant::now() >= deadline {
                break;
            }
        }

        let health = if samples == 0 { 0.0 } else { passed as f64 / samples as f64 };
        if health < cfg.health_threshold {
            return Err(OrchestratorError::CanaryDegraded {
                percent,
                reason: format!("health {health:.2} below threshold {}", cfg.health_threshold),
            });
        }

        let (requests, errors) = canaries
            .iter()
            .filter_map(|id| self.registry.instance(id))
            .fold((0u64, 0u64), |(r, e), i| (r + i.request_count, e + i.error_count));
        let error_rate = if requests == 0 { 0.0 } else { errors as f64 / requests as f64 };
        if error_rate > cfg.max_error_rate {
            return Err(OrchestratorError::CanaryDegraded {
                percent,
                reason: format!("error rate {error_rate:.3} above {}", cfg.max_error_rate),
            });
        }

        debug!(deployment = %self.deployment_id, percent, health, error_rate, "canary checkpoint passed");
        Ok(())
    }

    // ── Shared steps ───────────────────────────────────────────────

    /// Route everything to the new version and remove `retired`.
    fn retire_and_switch(&self, retired: &[InstanceId]) -> OrchestratorResult<()> {
        self.checkpoint()?;
        let removed =
            self.registry
                .switch_traffic(&self.endpoint.endpoint_id, &self.config.version, retired)?;
        for inst in &removed {
            self.discard(&inst.instance_id);
        }
        Ok(())
    }

    /// Drop per-instance health history and breaker state of a removed instance.
    fn discard(&self, instance_id: &str) {
        self.checker.forget(instance_id);
        if let Some(breakers) = &self.breakers {
            breakers.remove(instance_id);
        }
    }

    /// Instances to run once deployed.
    fn target_count(&self, existing: usize) -> usize {
        let count = match self.config.instance_count {
            Some(n) => n as usize,
            None => existing.max(self.endpoint.load_balancer.min_instances as usize),
        };
        count.max(1)
    }

    /// Create `count` new instances of the target version on free ports from `first_port`.
    fn spawn_instances(&self, count: usize, first_port: u16) -> OrchestratorResult<Vec<InstanceId>> {
        let ports = crate::orchestrator::free_ports(
            &self.registry,
            &self.endpoint.endpoint_id,
            &self.config.host,
            first_port,
            count,
        );
        let mut ids = Vec::with_capacity(ports.len());
        for port in ports {
            let inst = ServiceInstance::new(
                &self.endpoint.endpoint_id,
                &self.config.host,
                port,
                &self.config.version,
            );
            ids.push(inst.instance_id.clone());
            self.registry.insert_instance(inst)?;
        }
        Ok(ids)
    }

    /// Probe `ids`, failing if any has been removed.
    async fn probe(&self, ids: &[InstanceId]) -> OrchestratorResult<Vec<ServiceInstance>> {
        let mut current = Vec::with_capacity(ids.len());
        for id in ids {
            let inst = self
                .registry
                .instance(id)
                .ok_or_else(|| OrchestratorError::InstanceFailed(id.clone()))?;
            current.push(inst);
        }
        Ok(probe_instances(&self.checker, &self.registry, current).await)
    }

    /// Poll until every instance in `ids` is healthy, or `timeout` elapses.
    async fn wait_healthy(
        &mut self,
        ids: &[InstanceId],
        timeout: Duration,
        poll: Duration,
    ) -> OrchestratorResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.checkpoint()?;
            let probed = self.probe(ids).await?;
            let healthy = probed.iter().filter(|i| i.status == InstanceStatus::Healthy).count();
            if healthy == ids.len() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::Timeout {
                    secs: timeout.as_secs(),
                    pending: ids.len() - healthy,
                });
            }
            debug!(
                deployment = %self.deployment_id,
                healthy,
                waiting_for = ids.len(),
                "waiting for instances to become healthy"
            );
            self.pause(poll.min(deadline - now)).await?;
        }
    }

    /// Sleep, waking early on cancellation.
    async fn pause(&mut self, duration: Duration) -> OrchestratorResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            changed = self.cancel.changed() => {
                if changed.is_err() {
                    // Orchestrator dropped: finish the sleep uncancellable.
                    tokio::time::sleep(duration).await;
                }
            }
        }
        self.checkpoint()
    }

    fn checkpoint(&self) -> OrchestratorResult<()> {
        if *self.cancel.borrow() {
            return Err(OrchestratorError::Cancelled);
        }
        Ok(())
    }

    fn progress(&self, percent: u8) -> OrchestratorResult<()> {
        self.update(|d| d.advance_progress(percent))
    }

    fn update(&self, f: impl FnOnce(&mut DeploymentStatus)) -> OrchestratorResult<()> {
        self.registry.update_deployment(&self.deployment_id, f)?;
        Ok(())
    }
}
