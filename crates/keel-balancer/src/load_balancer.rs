//! Instance selection.
//!
//! [`LoadBalancer::select_instance`] first narrows the pool to eligible
//! candidates, then applies one of four strategies. Round-robin keeps a
//! lock-free cursor per endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;

use keel_state::{InstanceStatus, LoadBalancingStrategy, ServiceInstance};

/// Minimum score an instance needs to be preferred.
pub const PREFERRED_SCORE: f64 = 0.7;

/// Weight floor for weighted selection, so no instance starves.
pub const MIN_WEIGHT: f64 = 0.1;

/// A monotonic cursor that selects indices into an instance pool.
///
/// Uses `AtomicUsize` for lock-free concurrent selection; the counter
/// is reduced modulo the pool size on every call.
#[derive(Debug, Default)]
pub struct RoundRobinCursor {
    counter: AtomicUsize,
}

impl RoundRobinCursor {
    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(idx % count)
    }
}

/// Candidates eligible for selection.
///
/// Healthy instances scoring above [`PREFERRED_SCORE`]; failing that,
/// anything healthy or still starting.
pub fn eligible(instances: &[ServiceInstance]) -> Vec<&ServiceInstance> {
    let preferred: Vec<_> = instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Healthy && i.health_score > PREFERRED_SCORE)
        .collect();
    if !preferred.is_empty() {
        return preferred;
    }
    instances
        .iter()
        .filter(|i| matches!(i.status, InstanceStatus::Healthy | InstanceStatus::Starting))
        .collect()
}

/// Selects an instance per request using an endpoint's strategy.
#[derive(Default)]
pub struct LoadBalancer {
    cursors: RwLock<HashMap<String, Arc<RoundRobinCursor>>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick one instance, or `None` if nothing is eligible.
    pub fn select_instance<'a>(
        &self,
        instances: &'a [ServiceInstance],
        strategy: LoadBalancingStrategy,
    ) -> Option<&'a ServiceInstance> {
        self.select_with_rng(instances, strategy, &mut rand::thread_rng())
    }

    /// [`select_instance`](Self::select_instance) with an explicit random source.
    pub fn select_with_rng<'a, R: Rng + ?Sized>(
        &self,
        instances: &'a [ServiceInstance],
        strategy: LoadBalancingStrategy,
        rng: &mut R,
    ) -> Option<&'a ServiceInstance> {
        let candidates = eligible(instances);
        let first = candidates.first()?;

        match strategy {
            LoadBalancingStrategy::RoundRobin => {
                let cursor = self.cursor(&first.endpoint_id);
                cursor.next(candidates.len()).map(|i| candidates[i])
            }
            LoadBalancingStrategy::WeightedRoundRobin => Some(weighted(&candidates, rng)),
            LoadBalancingStrategy::LeastConnections => {
                // min_by_key keeps the first minimum.
                candidates.iter().copied().min_by_key(|i| i.request_count)
            }
            LoadBalancingStrategy::HealthBased => {
                let mut best = candidates[0];
                for &candidate in &candidates[1..] {
                    if candidate.health_score > best.health_score {
                        best = candidate;
                    }
                }
                Some(best)
            }
        }
    }

    fn cursor(&self, endpoint_id: &str) -> Arc<RoundRobinCursor> {
        if let Some(cursor) = self
            .cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint_id)
        {
            return cursor.clone();
        }
        self.cursors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint_id.to_string())
            .or_default()
            .clone()
    }
}

/// Draw one candidate with probability proportional to `max(0.1, score)`.
fn weighted<'a, R: Rng + ?Sized>(candidates: &[&'a ServiceInstance], rng: &mut R) -> &'a ServiceInstance {
    let weight = |i: &ServiceInstance| i.health_score.max(MIN_WEIGHT);
    let total: f64 = candidates.iter().map(|&i| weight(i)).sum();
    let mut point = rng.gen_range(0.0..total);
    for &candidate in candidates {
        point -= weight(candidate);
        if point < 0.0 {
            return candidate;
        }
    }
    // Float rounding can leave a sliver past the last weight.
    candidates[candidates.len() - 1]
}
