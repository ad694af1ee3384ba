//! Rollout parameters — blue-green, rolling update, canary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to deploy, plus per-strategy tuning.
///
/// Every field has a default, so `{"version": "v2"}` is a complete request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Release label the new instances run.
    pub version: String,
    /// Instances to run once deployed. Defaults to the current instance
    /// count, or the endpoint's `min_instances` if that is larger.
    #[serde(default)]
    pub instance_count: Option<u32>,
    /// Host new instances are placed on.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub blue_green: BlueGreenConfig,
    #[serde(default)]
    pub rolling: RollingConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl DeployConfig {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            instance_count: None,
            host: default_host(),
            blue_green: BlueGreenConfig::default(),
            rolling: RollingConfig::default(),
            canary: CanaryConfig::default(),
        }
    }

    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.instance_count = Some(count);
        self
    }
}

/// Spin up a full parallel set, then switch all traffic at once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlueGreenConfig {
    /// Green instances listen from `endpoint.port + port_offset` upwards.
    pub port_offset: u16,
    /// Seconds between health polls of the green set.
    pub poll_interval_secs: u64,
    /// Seconds to wait for the whole green set to become healthy.
    pub timeout_secs: u64,
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            port_offset: 1000,
            poll_interval_secs: 5,
            timeout_secs: 300,
        }
    }
}

/// Replace instances one at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollingConfig {
    /// Seconds to wait for each replacement to become healthy.
    pub health_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            health_timeout_secs: 120,
            poll_interval_secs: 5,
        }
    }
}

/// Shift traffic to the new version in steps, observing health at each.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanaryConfig {
    /// Traffic percentages to step through. The last step should be 100.
    pub checkpoints: Vec<u8>,
    /// Seconds to observe the canary at each checkpoint below 100%.
    pub observation_secs: u64,
    /// Minimum mean health score of canary instances.
    pub health_threshold: f64,
    /// Maximum fraction of failed requests on canary instances.
    pub max_error_rate: f64,
    /// Seconds to wait for new canary instances to become healthy.
    pub health_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            checkpoints: vec![10, 25, 50, 100],
            observation_secs: 60,
            health_threshold: 0.8,
            max_error_rate: 0.05,
            health_timeout_secs: 120,
            poll_interval_secs: 5,
        }
    }
}

impl CanaryConfig {
    /// Checkpoints clamped to 1..=100, ascending, deduplicated, ending at 100.
    pub fn steps(&self) -> Vec<u8> {
        let mut steps: Vec<u8> = self.checkpoints.iter().map(|p| (*p).clamp(1, 100)).collect();
        steps.sort_unstable();
        steps.dedup();
        if steps.last() != Some(&100) {
            steps.push(100);
        }
        steps
    }
}

pub(crate) fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}
