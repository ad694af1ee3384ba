//! Registry — the shared in-memory view of endpoints, instances, and
//! deployments, written through to the [`StateStore`].
//!
//! One `Registry` is built at startup and cloned into every API handler,
//! deployment task, and the reconciliation loop. Each record kind sits
//! behind its own lock. A lock is held only for the in-memory mutation;
//! it is released before the row is upserted and is never held across
//! an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::*;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    store: StateStore,
    endpoints: RwLock<HashMap<EndpointId, DeploymentEndpoint>>,
    instances: RwLock<HashMap<InstanceId, ServiceInstance>>,
    deployments: RwLock<HashMap<DeploymentId, DeploymentStatus>>,
    routes: RwLock<HashMap<EndpointId, TrafficRoute>>,
}

/// Shared registries for one Keel process.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create an empty registry on top of `store`.
    pub fn new(store: StateStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                endpoints: RwLock::new(HashMap::new()),
                instances: RwLock::new(HashMap::new()),
                deployments: RwLock::new(HashMap::new()),
                routes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a registry hydrated from everything already in `store`.
    ///
    /// Deployments that were in flight when the previous process exited
    /// are loaded as-is; they are readable but nothing resumes them.
    pub fn load(store: StateStore) -> StateResult<Self> {
        let endpoints = store.list_endpoints()?;
        let instances = store.list_instances()?;
        let deployments = store.list_deployments()?;
        let registry = Self::new(store);

        {
            // Stable version is the last completed rollout's target.
            let mut routes = write(&registry.inner.routes);
            for e in &endpoints {
                let stable = deployments
                    .iter()
                    .filter(|d| d.endpoint_id == e.endpoint_id && d.status == DeploymentState::Completed)
                    .max_by_key(|d| d.completed_at)
                    .map_or(INITIAL_VERSION, |d| d.target_version.as_str());
                routes.insert(e.endpoint_id.clone(), TrafficRoute::new(&e.endpoint_id, stable));
            }
        }
        info!(
            endpoints = endpoints.len(),
            instances = instances.len(),
            deployments = deployments.len(),
            "registry loaded from state store"
        );
        write(&registry.inner.endpoints)
            .extend(endpoints.into_iter().map(|e| (e.endpoint_id.clone(), e)));
        write(&registry.inner.instances)
            .extend(instances.into_iter().map(|i| (i.instance_id.clone(), i)));
        write(&registry.inner.deployments)
            .extend(deployments.into_iter().map(|d| (d.deployment_id.clone(), d)));
        Ok(registry)
    }

    /// The backing persistence store.
    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    // ── Endpoints ──────────────────────────────────────────────────

    /// Register (or re-register) an endpoint.
    pub fn register_endpoint(&self, endpoint: DeploymentEndpoint) -> StateResult<()> {
        let id = endpoint.endpoint_id.clone();
        write(&self.inner.routes)
            .entry(id.clone())
            .or_insert_with(|| TrafficRoute::new(&id, INITIAL_VERSION));
        write(&self.inner.endpoints).insert(id.clone(), endpoint.clone());
        self.inner.store.put_endpoint(&endpoint)?;
        info!(endpoint = %id, "endpoint registered");
        Ok(())
    }

    pub fn endpoint(&self, endpoint_id: &str) -> Option<DeploymentEndpoint> {
        read(&self.inner.endpoints).get(endpoint_id).cloned()
    }

    /// All endpoints, ordered by id.
    pub fn endpoints(&self) -> Vec<DeploymentEndpoint> {
        let mut all: Vec<_> = read(&self.inner.endpoints).values().cloned().collect();
        all.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        all
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Add a new instance. Its endpoint must already be registered.
    pub fn insert_instance(&self, instance: ServiceInstance) -> StateResult<()> {
        if !read(&self.inner.endpoints).contains_key(&instance.endpoint_id) {
            return Err(StateError::NotFound(format!("endpoint {}", instance.endpoint_id)));
        }
        write(&self.inner.instances).insert(instance.instance_id.clone(), instance.clone());
        self.inner.store.put_instance(&instance)?;
        debug!(instance_id = %instance.instance_id, endpoint = %instance.endpoint_id, "instance created");
        Ok(())
    }

    pub fn instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        read(&self.inner.instances).get(instance_id).cloned()
    }

    /// Every instance, oldest first.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<_> = read(&self.inner.instances).values().cloned().collect();
        sort_oldest_first(&mut all);
        all
    }

    /// Instances of one endpoint, oldest first.
    pub fn instances_for(&self, endpoint_id: &str) -> Vec<ServiceInstance> {
        let mut all: Vec<_> = read(&self.inner.instances)
            .values()
            .filter(|i| i.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        sort_oldest_first(&mut all);
        all
    }

    /// Apply `f` to an instance and persist the result.
    ///
    /// Returns `None` if the instance no longer exists (e.g. it was torn
    /// down while the caller was awaiting I/O).
    pub fn update_instance(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut ServiceInstance),
    ) -> StateResult<Option<ServiceInstance>> {
        let updated = {
            let mut instances = write(&self.inner.instances);
            match instances.get_mut(instance_id) {
                Some(inst) => {
                    f(inst);
                    inst.clone()
                }
                None => return Ok(None),
            }
        };
        self.inner.store.put_instance(&updated)?;
        Ok(Some(updated))
    }

    /// Remove a set of instances in one mutation. Returns those that existed.
    pub fn remove_instances(&self, instance_ids: &[InstanceId]) -> StateResult<Vec<ServiceInstance>> {
        let removed: Vec<ServiceInstance> = {
            let mut instances = write(&self.inner.instances);
            instance_ids.iter().filter_map(|id| instances.remove(id)).collect()
        };
        for inst in &removed {
            self.inner.store.delete_instance(&inst.instance_id)?;
        }
        Ok(removed)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn insert_deployment(&self, deployment: DeploymentStatus) -> StateResult<()> {
        write(&self.inner.deployments).insert(deployment.deployment_id.clone(), deployment.clone());
        self.inner.store.put_deployment(&deployment)
    }

    pub fn deployment(&self, deployment_id: &str) -> Option<DeploymentStatus> {
        read(&self.inner.deployments).get(deployment_id).cloned()
    }

    /// All deployments, most recent first.
    pub fn deployments(&self) -> Vec<DeploymentStatus> {
        let mut all: Vec<_> = read(&self.inner.deployments).values().cloned().collect();
        all.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.deployment_id.cmp(&b.deployment_id))
        });
        all
    }

    /// Apply `f` to a deployment record and persist the result.
    pub fn update_deployment(
        &self,
        deployment_id: &str,
        f: impl FnOnce(&mut DeploymentStatus),
    ) -> StateResult<Option<DeploymentStatus>> {
        let updated = {
            let mut deployments = write(&self.inner.deployments);
            match deployments.get_mut(deployment_id) {
                Some(d) => {
                    f(d);
                    d.clone()
                }
                None => return Ok(None),
            }
        };
        self.inner.store.put_deployment(&updated)?;
        Ok(Some(updated))
    }

    // ── Routing ────────────────────────────────────────────────────

    /// Current traffic split for an endpoint.
    pub fn route(&self, endpoint_id: &str) -> TrafficRoute {
        read(&self.inner.routes)
            .get(endpoint_id)
            .cloned()
            .unwrap_or_else(|| TrafficRoute::new(endpoint_id, INITIAL_VERSION))
    }

    /// Apply `f` to an endpoint's traffic split.
    pub fn update_route(&self, endpoint_id: &str, f: impl FnOnce(&mut TrafficRoute)) -> TrafficRoute {
        let mut routes = write(&self.inner.routes);
        let route = routes
            .entry(endpoint_id.to_string())
            .or_insert_with(|| TrafficRoute::new(endpoint_id, INITIAL_VERSION));
        f(route);
        route.clone()
    }

    /// Make `version` the only routed version of an endpoint and drop the
    /// `retired` instances, as one step from a router's point of view.
    pub fn switch_traffic(
        &self,
        endpoint_id: &str,
        version: &str,
        retired: &[InstanceId],
    ) -> StateResult<Vec<ServiceInstance>> {
        let removed: Vec<ServiceInstance> = {
            let mut instances = write(&self.inner.instances);
            let mut routes = write(&self.inner.routes);
            let removed: Vec<ServiceInstance> =
                retired.iter().filter_map(|id| instances.remove(id)).collect();
            let route = routes
                .entry(endpoint_id.to_string())
                .or_insert_with(|| TrafficRoute::new(endpoint_id, version));
            route.stable_version = version.to_string();
            route.canary_version = None;
            route.canary_percent = 0;
            removed
        };
        for inst in &removed {
            self.inner.store.delete_instance(&inst.instance_id)?;
        }
        info!(endpoint = %endpoint_id, %version, retired = removed.len(), "traffic switched");
        Ok(removed)
    }
}

fn sort_oldest_first(instances: &mut [ServiceInstance]) {
    instances.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });
}
