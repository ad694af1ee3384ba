//! Health checker — per-instance probe history and health scores.
//!
//! Every probe result is appended to a bounded ring buffer per instance.
//! The health score is the healthy fraction of the most recent window of
//! that history. The checker never touches the registry itself; callers
//! apply an [`Assessment`] to the instance record.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use keel_state::{DeploymentEndpoint, InstanceStatus, ServiceInstance, epoch_millis, epoch_secs};

use crate::probe::{Probe, ProbeOutcome};

/// Maximum probe records kept per instance.
pub const HISTORY_CAPACITY: usize = 100;

/// Number of most recent records the score is computed over.
pub const SCORE_WINDOW: usize = 20;

/// Score reported for an instance with no probe history.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Health checking parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckConfig {
    /// Per-probe timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How long a never-healthy instance may stay `starting` while failing probes.
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_startup_grace_secs() -> u64 {
    120
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            startup_grace_secs: default_startup_grace_secs(),
        }
    }
}

impl HealthCheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One entry in an instance's probe history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthRecord {
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub healthy: bool,
    pub payload: Value,
}

/// Outcome of probing one instance, ready to apply to its record.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub outcome: ProbeOutcome,
    pub score: f64,
    pub status: InstanceStatus,
    /// Unix timestamp (seconds) of the probe.
    pub checked_at: u64,
}

impl Assessment {
    /// Write the derived health into an instance record.
    ///
    /// An instance already `stopping` keeps that status.
    pub fn apply(&self, instance: &mut ServiceInstance) {
        if instance.status != InstanceStatus::Stopping {
            instance.status = self.status;
        }
        instance.health_score = self.score;
        instance.last_health_check = Some(self.checked_at);
        if let Some(cpu) = self.outcome.payload.get("cpu_usage").and_then(Value::as_f64) {
            instance.cpu_usage = cpu;
        }
        if let Some(mem) = self.outcome.payload.get("memory_usage").and_then(Value::as_f64) {
            instance.memory_usage = mem;
        }
    }
}

/// Active prober plus rolling health history for every instance.
pub struct HealthChecker {
    probe: Arc<dyn Probe>,
    config: HealthCheckConfig,
    histories: Mutex<HashMap<String, VecDeque<HealthRecord>>>,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn Probe>, config: HealthCheckConfig) -> Self {
        Self {
            probe,
            config,
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Probe one instance. Never fails: errors and timeouts come back unhealthy.
    pub async fn check_health(
        &self,
        instance: &ServiceInstance,
        path: &str,
        timeout: Duration,
    ) -> ProbeOutcome {
        match tokio::time::timeout(timeout, self.probe.probe(instance, path, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::unhealthy(format!("timed out after {}ms", timeout.as_millis())),
        }
    }

    /// Append a probe result, evicting the oldest entry past capacity.
    pub fn update_health_history(&self, instance_id: &str, is_healthy: bool, payload: Value) {
        let mut histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        let history = histories.entry(instance_id.to_string()).or_default();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(HealthRecord {
            timestamp: epoch_secs(),
            healthy: is_healthy,
            payload,
        });
    }

    /// Healthy fraction of the last [`SCORE_WINDOW`] probes, or
    /// [`NEUTRAL_SCORE`] with no history.
    pub fn calculate_health_score(&self, instance_id: &str) -> f64 {
        let histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(history) = histories.get(instance_id).filter(|h| !h.is_empty()) else {
            return NEUTRAL_SCORE;
        };
        let window = history.len().min(SCORE_WINDOW);
        let healthy = history.iter().rev().take(window).filter(|r| r.healthy).count();
        healthy as f64 / window as f64
    }

    /// Snapshot of an instance's probe history, oldest first.
    pub fn history(&self, instance_id: &str) -> Vec<HealthRecord> {
        let histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        histories
            .get(instance_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an instance has ever passed a probe within the retained history.
    fn has_passed(&self, instance_id: &str) -> bool {
        let histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        histories
            .get(instance_id)
            .is_some_and(|h| h.iter().any(|r| r.healthy))
    }

    /// Drop history for instances that no longer exist.
    pub fn forget(&self, instance_id: &str) {
        let mut histories = self.histories.lock().unwrap_or_else(PoisonError::into_inner);
        histories.remove(instance_id);
    }

    /// Probe an instance of `endpoint`, record the result, and derive its
    /// new score and status.
    pub async fn assess(
        &self,
        instance: &ServiceInstance,
        endpoint: &DeploymentEndpoint,
    ) -> Assessment {
        let outcome = self
            .check_health(instance, &endpoint.health_check_path, self.config.timeout())
            .await;
        self.update_health_history(&instance.instance_id, outcome.healthy, outcome.payload.clone());
        let score = self.calculate_health_score(&instance.instance_id);
        let status = self.next_status(instance, outcome.healthy, epoch_millis());

        debug!(
            instance_id = %instance.instance_id,
            healthy = outcome.healthy,
            score,
            %status,
            "instance assessed"
        );

        Assessment {
            outcome,
            score,
            status,
            checked_at: epoch_secs(),
        }
    }

    /// Status after a probe: a pass is `healthy`; a failure is `unhealthy`
    /// unless the instance is still inside its startup grace period and has
    /// never passed, in which case it stays `starting`.
    fn next_status(&self, instance: &ServiceInstance, healthy: bool, now_ms: u64) -> InstanceStatus {
        if instance.status == InstanceStatus::Stopping {
            return InstanceStatus::Stopping;
        }
        if healthy {
            return InstanceStatus::Healthy;
        }
        let age_ms = now_ms.saturating_sub(instance.created_at);
        let in_grace = age_ms < self.config.startup_grace_secs * 1000;
        if instance.status == InstanceStatus::Starting
            && in_grace
            && !self.has_passed(&instance.instance_id)
        {
            InstanceStatus::Starting
        } else {
            InstanceStatus::Unhealthy
        }
    }
}
