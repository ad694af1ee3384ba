//! `keel.toml` — daemon configuration file.
//!
//! ```toml
//! [health]
//! timeout_secs = 5
//! startup_grace_secs = 120
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 60
//! success_threshold = 3
//!
//! [reconcile]
//! interval_secs = 30
//!
//! [[endpoints]]
//! endpoint_id = "api"
//! domain = "example.com"
//! service_type = "web"
//! port = 8000
//! auto_scaling = true
//! load_balancer = { strategy = "least_connections", min_instances = 2, max_instances = 6 }
//! ```
//!
//! Every section is optional.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use keel_balancer::CircuitBreakerConfig;
use keel_health::HealthCheckConfig;
use keel_reconcile::ReconcileConfig;
use keel_state::{DeploymentEndpoint, Registry};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub health: HealthCheckConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub reconcile: ReconcileConfig,
    pub endpoints: Vec<DeploymentEndpoint>,
}

impl KeelConfig {
    /// Read the file at `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        for endpoint in &config.endpoints {
            let lb = &endpoint.load_balancer;
            anyhow::ensure!(
                lb.min_instances <= lb.max_instances,
                "endpoint {}: min_instances {} exceeds max_instances {}",
                endpoint.endpoint_id,
                lb.min_instances,
                lb.max_instances
            );
        }
        Ok(config)
    }

    /// Register configured endpoints the store does not already know.
    ///
    /// Endpoints that survived a restart keep their stored definition.
    pub fn register_endpoints(&self, registry: &Registry) -> anyhow::Result<usize> {
        let mut added = 0;
        for endpoint in &self.endpoints {
            if registry.endpoint(&endpoint.endpoint_id).is_some() {
                continue;
            }
            registry.register_endpoint(endpoint.clone())?;
            added += 1;
        }
        if added > 0 {
            info!(count = added, "endpoints registered from config");
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_state::{LoadBalancingStrategy, StateStore};

    const SAMPLE: &str = r#"
        [health]
        timeout_secs = 2

        [reconcile]
        interval_secs = 10

        [[endpoints]]
        endpoint_id = "api"
        domain = "example.com"
        service_type = "web"
        port = 8000
        auto_scaling = true
        load_balancer = { strategy = "least_connections", min_instances = 2, max_instances = 6 }
    "#;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = KeelConfig::parse("").unwrap();
        assert_eq!(config.health, HealthCheckConfig::default());
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
        assert_eq!(config.reconcile.interval_secs, 30);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn parses_sections_and_fills_gaps() {
        let config = KeelConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.health.timeout_secs, 2);
        assert_eq!(config.health.startup_grace_secs, 120);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.reconcile.interval_secs, 10);

        let api = &config.endpoints[0];
        assert_eq!(api.health_check_path, "/health");
        assert!(api.circuit_breaker_enabled);
        assert_eq!(api.load_balancer.strategy, LoadBalancingStrategy::LeastConnections);
        assert_eq!(api.load_balancer.max_instances, 6);
    }

    #[test]
    fn rejects_inverted_instance_bounds() {
        let text = SAMPLE.replace("max_instances = 6", "max_instances = 1");
        let err = KeelConfig::parse(&text).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let text = SAMPLE.replace("least_connections", "fastest");
        assert!(KeelConfig::parse(&text).is_err());
    }

    #[test]
    fn missing_path_uses_defaults() {
        let config = KeelConfig::load(None).unwrap();
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn stored_endpoints_are_not_overwritten() {
        let config = KeelConfig::parse(SAMPLE).unwrap();
        let registry = Registry::new(StateStore::open_in_memory().unwrap());

        assert_eq!(config.register_endpoints(&registry).unwrap(), 1);
        let mut changed = config.endpoints[0].clone();
        changed.port = 9500;
        registry.register_endpoint(changed).unwrap();

        assert_eq!(config.register_endpoints(&registry).unwrap(), 0);
        assert_eq!(registry.endpoint("api").unwrap().port, 9500);
    }
}
