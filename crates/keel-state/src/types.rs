//! Domain types for the Keel state store.
//!
//! These types represent the persisted state of endpoints, service
//! instances, and deployments. All types are serializable to/from JSON
//! for storage in redb tables.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::UnknownStrategy;

/// Unique identifier for a deployment endpoint.
pub type EndpointId = String;

/// Unique identifier for a service instance.
pub type InstanceId = String;

/// Unique identifier for a deployment run.
pub type DeploymentId = String;

/// Version label given to instances that predate any tracked deployment.
pub const INITIAL_VERSION: &str = "initial";

// ── Strategies ────────────────────────────────────────────────────

/// How the load balancer picks an instance for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    #[default]
    HealthBased,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::HealthBased => "health_based",
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "health_based" => Ok(Self::HealthBased),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a new version is rolled out to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    BlueGreen,
    #[default]
    Rolling,
    Canary,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlueGreen => "blue_green",
            Self::Rolling => "rolling",
            Self::Canary => "canary",
        }
    }
}

impl FromStr for DeploymentStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue_green" => Ok(Self::BlueGreen),
            "rolling" => Ok(Self::Rolling),
            "canary" => Ok(Self::Canary),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Endpoint ──────────────────────────────────────────────────────

/// A logical named route that deployments target.
///
/// Registered once; treated as static for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentEndpoint {
    pub endpoint_id: EndpointId,
    pub domain: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    pub service_type: String,
    /// Base port for instances of this endpoint.
    pub port: u16,
    /// HTTP path probed by the health checker (e.g. "/health").
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub auto_scaling: bool,
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    #[serde(default)]
    pub deployment_strategy: DeploymentStrategy,
}

/// Load-balancer settings for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    pub min_instances: u32,
    pub max_instances: u32,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::HealthBased,
            min_instances: 1,
            max_instances: 10,
        }
    }
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

impl DeploymentEndpoint {
    /// Fully qualified host name served by this endpoint.
    pub fn fqdn(&self) -> String {
        match &self.subdomain {
            Some(sub) if !sub.is_empty() => format!("{sub}.{}", self.domain),
            _ => self.domain.clone(),
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// One running process backing an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub instance_id: InstanceId,
    pub endpoint_id: EndpointId,
    pub host: String,
    pub port: u16,
    /// Release label this instance runs.
    pub version: String,
    pub status: InstanceStatus,
    /// Rolling-window health in [0, 1]. Written only from probe history.
    pub health_score: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub request_count: u64,
    pub error_count: u64,
    /// Unix timestamp (seconds) of the last completed probe.
    pub last_health_check: Option<u64>,
    /// Unix timestamp (milliseconds) when the instance was created.
    pub created_at: u64,
}

/// Lifecycle status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceInstance {
    /// Create a fresh instance in `starting` state.
    ///
    /// The initial score is the neutral prior the health checker reports
    /// for an instance without probe history.
    pub fn new(endpoint_id: &str, host: &str, port: u16, version: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            instance_id: format!("{endpoint_id}-{}", &suffix[..8]),
            endpoint_id: endpoint_id.to_string(),
            host: host.to_string(),
            port,
            version: version.to_string(),
            status: InstanceStatus::Starting,
            health_score: 0.5,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            request_count: 0,
            error_count: 0,
            last_health_check: None,
            created_at: epoch_millis(),
        }
    }

    /// `host:port` address used for probing and routing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fraction of recorded requests that failed.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// A single rollout of `target_version` to an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatus {
    pub deployment_id: DeploymentId,
    pub endpoint_id: EndpointId,
    pub strategy: DeploymentStrategy,
    pub current_version: Option<String>,
    pub target_version: String,
    pub status: DeploymentState,
    pub progress_percentage: u8,
    /// Unix timestamp (seconds).
    pub started_at: u64,
    /// Unix timestamp (seconds), set once terminal.
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
}

/// Phase of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Planning,
    Deploying,
    Completed,
    Failed,
    Rollback,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rollback => "rollback",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rollback)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeploymentStatus {
    /// Create a `planning` record for a new deployment.
    pub fn new(
        endpoint_id: &str,
        strategy: DeploymentStrategy,
        current_version: Option<String>,
        target_version: &str,
    ) -> Self {
        Self {
            deployment_id: format!("deploy-{}", uuid::Uuid::new_v4().simple()),
            endpoint_id: endpoint_id.to_string(),
            strategy,
            current_version,
            target_version: target_version.to_string(),
            status: DeploymentState::Planning,
            progress_percentage: 0,
            started_at: epoch_secs(),
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move from `planning` to `deploying`.
    pub fn begin(&mut self) {
        if self.status == DeploymentState::Planning {
            self.status = DeploymentState::Deploying;
        }
    }

    /// Raise progress to `percent`. Never lowers it, never touches a terminal record.
    pub fn advance_progress(&mut self, percent: u8) {
        if self.is_terminal() {
            return;
        }
        self.progress_percentage = self.progress_percentage.max(percent.min(100));
    }

    /// Mark the deployment completed at 100%.
    pub fn complete(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.progress_percentage = 100;
        self.status = DeploymentState::Completed;
        self.completed_at = Some(epoch_secs());
    }

    /// Mark the deployment failed, freezing progress where it stopped.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = DeploymentState::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(epoch_secs());
    }
}

// ── Routing ───────────────────────────────────────────────────────

/// Version-level traffic split for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficRoute {
    pub endpoint_id: EndpointId,
    /// Version that receives all non-canary traffic.
    pub stable_version: String,
    /// Version under canary observation, if any.
    pub canary_version: Option<String>,
    /// Share of requests (0-100) sent to `canary_version`.
    pub canary_percent: u8,
}

impl TrafficRoute {
    pub fn new(endpoint_id: &str, stable_version: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            stable_version: stable_version.to_string(),
            canary_version: None,
            canary_percent: 0,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_snake_case() {
        assert_eq!("blue_green".parse::<DeploymentStrategy>().unwrap(), DeploymentStrategy::BlueGreen);
        assert_eq!(
            "weighted_round_robin".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::WeightedRoundRobin
        );
        let err = "big_bang".parse::<DeploymentStrategy>().unwrap_err();
        assert_eq!(err.0, "big_bang");
    }

    #[test]
    fn endpoint_defaults_from_json() {
        let json = r#"{"endpoint_id":"api","domain":"example.com","service_type":"web","port":8000}"#;
        let endpoint: DeploymentEndpoint = serde_json::from_str(json).unwrap();
        assert_eq!(endpoint.health_check_path, "/health");
        assert_eq!(endpoint.load_balancer.strategy, LoadBalancingStrategy::HealthBased);
        assert_eq!(endpoint.deployment_strategy, DeploymentStrategy::Rolling);
        assert!(endpoint.circuit_breaker_enabled);
        assert_eq!(endpoint.fqdn(), "example.com");
    }

    #[test]
    fn new_instance_starts_with_neutral_score() {
        let inst = ServiceInstance::new("api", "10.0.0.1", 8001, "v1");
        assert!(inst.instance_id.starts_with("api-"));
        assert_eq!(inst.status, InstanceStatus::Starting);
        assert_eq!(inst.health_score, 0.5);
        assert_eq!(inst.address(), "10.0.0.1:8001");
        assert_eq!(inst.error_rate(), 0.0);
    }

    #[test]
    fn progress_is_monotonic() {
        let mut d = DeploymentStatus::new("api", DeploymentStrategy::Rolling, None, "v2");
        d.begin();
        d.advance_progress(40);
        d.advance_progress(20);
        assert_eq!(d.progress_percentage, 40);
        d.advance_progress(250);
        assert_eq!(d.progress_percentage, 100);
    }

    #[test]
    fn terminal_record_is_frozen() {
        let mut d = DeploymentStatus::new("api", DeploymentStrategy::BlueGreen, None, "v2");
        d.begin();
        d.advance_progress(30);
        d.fail("timed out");
        d.advance_progress(90);
        d.complete();
        assert_eq!(d.status, DeploymentState::Failed);
        assert_eq!(d.progress_percentage, 30);
        assert_eq!(d.error_message.as_deref(), Some("timed out"));
        assert!(d.completed_at.is_some());
    }
}
