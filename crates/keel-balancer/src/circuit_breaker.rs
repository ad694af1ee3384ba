//! Per-instance circuit breakers.
//!
//! Each instance gets an independent `closed → open → half_open` state
//! machine. Breakers live in memory only; a restarted process starts
//! every instance closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Too many failures, requests are blocked.
    Open,
    /// Probing whether the instance has recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker thresholds, shared by every instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures in `closed` that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit blocks before trying `half_open`.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Successes in `half_open` that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
        }
    }

    fn transition_to(&mut self, instance_id: &str, next: CircuitState) {
        if self.state == next {
            return;
        }
        info!(instance_id, from = %self.state, to = %next, "circuit breaker transition");
        self.state = next;
        match next {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => self.success_count = 0,
            CircuitState::Open => {}
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
        }
    }
}

/// Registry of circuit breakers keyed by instance id.
///
/// Breakers are created lazily, closed, the first time an instance is seen.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a request may be sent to `instance_id` now.
    pub fn can_request(&self, instance_id: &str) -> bool {
        self.can_request_at(instance_id, Instant::now())
    }

    /// [`can_request`](Self::can_request) evaluated at `now`.
    ///
    /// An open breaker whose recovery timeout has strictly elapsed since
    /// the last failure moves to `half_open` and lets the request through.
    pub fn can_request_at(&self, instance_id: &str, now: Instant) -> bool {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(breaker) = breakers.get_mut(instance_id) else {
            return true;
        };
        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = breaker
                    .last_failure
                    .is_none_or(|t| now.saturating_duration_since(t) > self.config.recovery_timeout());
                if recovered {
                    breaker.transition_to(instance_id, CircuitState::HalfOpen);
                }
                recovered
            }
        }
    }

    pub fn record_success(&self, instance_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(instance_id.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count = breaker.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    breaker.transition_to(instance_id, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, instance_id: &str) {
        self.record_failure_at(instance_id, Instant::now());
    }

    /// [`record_failure`](Self::record_failure) observed at `now`.
    pub fn record_failure_at(&self, instance_id: &str, now: Instant) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(instance_id.to_string()).or_insert_with(Breaker::new);
        breaker.last_failure = Some(now);
        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.config.failure_threshold {
                    warn!(instance_id, failures = breaker.failure_count, "circuit breaker opening");
                    breaker.transition_to(instance_id, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(instance_id, "circuit breaker re-opening after half-open failure");
                breaker.transition_to(instance_id, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of one breaker; instances never seen are closed.
    pub fn state(&self, instance_id: &str) -> CircuitState {
        self.snapshot(instance_id).state
    }

    pub fn snapshot(&self, instance_id: &str) -> BreakerSnapshot {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .get(instance_id)
            .map(Breaker::snapshot)
            .unwrap_or_else(|| Breaker::new().snapshot())
    }

    /// Count of breakers currently open.
    pub fn open_count(&self) -> usize {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.values().filter(|b| b.state == CircuitState::Open).count()
    }

    /// Forget a removed instance.
    pub fn remove(&self, instance_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.remove(instance_id);
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
