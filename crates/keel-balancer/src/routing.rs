//! Request routing.
//!
//! The [`Router`] turns an endpoint id into a concrete instance: it picks
//! the version group from the endpoint's traffic split, drops instances
//! whose circuit is open, and hands the rest to the [`LoadBalancer`].

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use keel_state::{InstanceStatus, Registry, ServiceInstance, TrafficRoute};

use crate::circuit_breaker::CircuitBreakers;
use crate::error::{RoutingError, RoutingResult};
use crate::load_balancer::LoadBalancer;

/// Routes requests for every endpoint in a [`Registry`].
#[derive(Clone)]
pub struct Router {
    registry: Registry,
    balancer: Arc<LoadBalancer>,
    breakers: Arc<CircuitBreakers>,
}

impl Router {
    pub fn new(registry: Registry, breakers: Arc<CircuitBreakers>) -> Self {
        Self {
            registry,
            balancer: Arc::new(LoadBalancer::new()),
            breakers,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Select the instance that should serve the next request to `endpoint_id`.
    pub fn route(&self, endpoint_id: &str) -> RoutingResult<ServiceInstance> {
        self.route_with_rng(endpoint_id, &mut rand::thread_rng())
    }

    pub fn route_with_rng<R: Rng + ?Sized>(
        &self,
        endpoint_id: &str,
        rng: &mut R,
    ) -> RoutingResult<ServiceInstance> {
        let endpoint = self
            .registry
            .endpoint(endpoint_id)
            .ok_or_else(|| RoutingError::UnknownEndpoint(endpoint_id.to_string()))?;
        let split = self.registry.route(endpoint_id);
        let instances = self.registry.instances_for(endpoint_id);

        let mut pool = version_group(&split, &instances, rng);
        if endpoint.circuit_breaker_enabled {
            pool.retain(|i| self.breakers.can_request(&i.instance_id));
        }

        let picked = self
            .balancer
            .select_with_rng(&pool, endpoint.load_balancer.strategy, rng)
            .ok_or_else(|| RoutingError::NoAvailableInstance(endpoint_id.to_string()))?;
        debug!(
            endpoint = %endpoint_id,
            instance_id = %picked.instance_id,
            version = %picked.version,
            "request routed"
        );
        Ok(picked.clone())
    }

    /// Record how a routed request went.
    pub fn record_outcome(&self, instance_id: &str, success: bool) -> RoutingResult<ServiceInstance> {
        let updated = self
            .registry
            .update_instance(instance_id, |inst| {
                inst.request_count += 1;
                if !success {
                    inst.error_count += 1;
                }
            })?
            .ok_or_else(|| RoutingError::UnknownInstance(instance_id.to_string()))?;
        if success {
            self.breakers.record_success(instance_id);
        } else {
            self.breakers.record_failure(instance_id);
        }
        Ok(updated)
    }
}

/// Instances of the version group this request falls into.
///
/// With probability `canary_percent` the canary group is chosen. Whichever
/// group is chosen, an empty one falls back to the other.
fn version_group<R: Rng + ?Sized>(
    split: &TrafficRoute,
    instances: &[ServiceInstance],
    rng: &mut R,
) -> Vec<ServiceInstance> {
    let live = |version: &str| -> Vec<ServiceInstance> {
        instances
            .iter()
            .filter(|i| i.version == version && i.status != InstanceStatus::Stopping)
            .cloned()
            .collect()
    };

    if let Some(canary) = &split.canary_version {
        if split.canary_percent > 0 && rng.gen_range(0..100u8) < split.canary_percent {
            let group = live(canary);
            if !group.is_empty() {
                return group;
            }
        }
        let stable = live(&split.stable_version);
        if stable.is_empty() {
            return live(canary);
        }
        return stable;
    }
    live(&split.stable_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_state::{DeploymentEndpoint, DeploymentStrategy, LoadBalancerConfig, StateStore};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn setup() -> (Registry, Router) {
        let registry = Registry::new(StateStore::open_in_memory().unwrap());
        registry
            .register_endpoint(DeploymentEndpoint {
                endpoint_id: "api".to_string(),
                domain: "example.com".to_string(),
                subdomain: Some("api".to_string()),
                service_type: "web".to_string(),
                port: 8000,
                health_check_path: "/health".to_string(),
                load_balancer: LoadBalancerConfig::default(),
                ssl_enabled: false,
                auto_scaling: false,
                circuit_breaker_enabled: true,
                deployment_strategy: DeploymentStrategy::Canary,
            })
            .unwrap();
        let router = Router::new(registry.clone(), Arc::new(CircuitBreakers::default()));
        (registry, router)
    }

    fn add(registry: &Registry, port: u16, version: &str, score: f64) -> String {
        let mut inst = ServiceInstance::new("api", "localhost", port, version);
        inst.status = InstanceStatus::Healthy;
        inst.health_score = score;
        let id = inst.instance_id.clone();
        registry.insert_instance(inst).unwrap();
        id
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let (_, router) = setup();
        assert!(matches!(router.route("ghost"), Err(RoutingError::UnknownEndpoint(_))));
    }

    #[test]
    fn no_instances_is_no_available_instance() {
        let (_, router) = setup();
        assert!(matches!(router.route("api"), Err(RoutingError::NoAvailableInstance(_))));
    }

    #[test]
    fn routes_only_to_stable_version_without_canary() {
        let (registry, router) = setup();
        let stable = add(&registry, 8001, "initial", 0.9);
        add(&registry, 9001, "v2", 1.0);

        for _ in 0..20 {
            assert_eq!(router.route("api").unwrap().instance_id, stable);
        }
    }

    #[test]
    fn canary_split_follows_percent() {
        let (registry, router) = setup();
        add(&registry, 8001, "initial", 0.9);
        let canary = add(&registry, 9001, "v2", 0.9);
        registry.update_route("api", |r| {
            r.canary_version = Some("v2".to_string());
            r.canary_percent = 25;
        });

        let mut rng = StdRng::seed_from_u64(11);
        let hits = (0..4000)
            .filter(|_| router.route_with_rng("api", &mut rng).unwrap().instance_id == canary)
            .count();
        assert!((800..1200).contains(&hits), "canary got {hits} of 4000");
    }

    #[test]
    fn open_breaker_removes_instance_from_pool() {
        let (registry, router) = setup();
        let bad = add(&registry, 8001, "initial", 1.0);
        let good = add(&registry, 8002, "initial", 0.8);

        for _ in 0..5 {
            router.record_outcome(&bad, false).unwrap();
        }
        for _ in 0..10 {
            assert_eq!(router.route("api").unwrap().instance_id, good);
        }

        let inst = registry.instance(&bad).unwrap();
        assert_eq!(inst.request_count, 5);
        assert_eq!(inst.error_count, 5);
    }

    #[test]
    fn outcome_for_unknown_instance_fails() {
        let (_, router) = setup();
        assert!(matches!(
            router.record_outcome("gone", true),
            Err(RoutingError::UnknownInstance(_))
        ));
    }
}
