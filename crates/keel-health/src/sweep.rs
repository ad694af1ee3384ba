//! Concurrent probe sweeps over registry instances.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use keel_state::{InstanceStatus, Registry, ServiceInstance};

use crate::checker::HealthChecker;

/// Probe `instances` concurrently and write each result back to the registry.
///
/// Total latency is bounded by the probe timeout, not the number of
/// instances. `stopping` instances and instances whose endpoint is gone
/// are skipped. An instance removed while its probe was in flight is
/// dropped silently. Returns the updated records.
pub async fn probe_instances(
    checker: &Arc<HealthChecker>,
    registry: &Registry,
    instances: Vec<ServiceInstance>,
) -> Vec<ServiceInstance> {
    let mut probes = JoinSet::new();
    for instance in instances {
        if instance.status == InstanceStatus::Stopping {
            continue;
        }
        let Some(endpoint) = registry.endpoint(&instance.endpoint_id) else {
            debug!(instance_id = %instance.instance_id, "skipping probe, endpoint unknown");
            continue;
        };
        let checker = checker.clone();
        probes.spawn(async move {
            let assessment = checker.assess(&instance, &endpoint).await;
            (instance.instance_id, assessment)
        });
    }

    let mut updated = Vec::with_capacity(probes.len());
    while let Some(joined) = probes.join_next().await {
        let (instance_id, assessment) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "health probe task failed");
                continue;
            }
        };
        match registry.update_instance(&instance_id, |inst| assessment.apply(inst)) {
            Ok(Some(inst)) => updated.push(inst),
            Ok(None) => debug!(%instance_id, "instance removed during probe"),
            Err(e) => warn!(%instance_id, error = %e, "failed to persist health result"),
        }
    }
    updated
}
