//! StateStore — redb-backed persistence for Keel.
//!
//! Three keyed upsert tables (endpoints, instances, deployments). Values
//! are JSON-serialized into redb's `&[u8]` columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENDPOINTS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn upsert<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Endpoints ──────────────────────────────────────────────────

    /// Insert or update an endpoint.
    pub fn put_endpoint(&self, endpoint: &DeploymentEndpoint) -> StateResult<()> {
        self.upsert(ENDPOINTS, &endpoint.endpoint_id, endpoint)?;
        debug!(endpoint = %endpoint.endpoint_id, "endpoint stored");
        Ok(())
    }

    pub fn get_endpoint(&self, endpoint_id: &str) -> StateResult<Option<DeploymentEndpoint>> {
        self.fetch(ENDPOINTS, endpoint_id)
    }

    pub fn list_endpoints(&self) -> StateResult<Vec<DeploymentEndpoint>> {
        self.scan(ENDPOINTS)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance.
    pub fn put_instance(&self, instance: &ServiceInstance) -> StateResult<()> {
        self.upsert(INSTANCES, &instance.instance_id, instance)
    }

    pub fn get_instance(&self, instance_id: &str) -> StateResult<Option<ServiceInstance>> {
        self.fetch(INSTANCES, instance_id)
    }

    pub fn list_instances(&self) -> StateResult<Vec<ServiceInstance>> {
        self.scan(INSTANCES)
    }

    /// List the instances that belong to one endpoint.
    pub fn list_instances_for_endpoint(&self, endpoint_id: &str) -> StateResult<Vec<ServiceInstance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.endpoint_id == endpoint_id)
            .collect())
    }

    /// Delete an instance by id. Returns true if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> StateResult<bool> {
        let existed = self.remove(INSTANCES, instance_id)?;
        debug!(%instance_id, existed, "instance deleted");
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment status record.
    pub fn put_deployment(&self, deployment: &DeploymentStatus) -> StateResult<()> {
        self.upsert(DEPLOYMENTS, &deployment.deployment_id, deployment)
    }

    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<DeploymentStatus>> {
        self.fetch(DEPLOYMENTS, deployment_id)
    }

    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentStatus>> {
        self.scan(DEPLOYMENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint(id: &str) -> DeploymentEndpoint {
        DeploymentEndpoint {
            endpoint_id: id.to_string(),
            domain: "example.com".to_string(),
            subdomain: Some("api".to_string()),
            service_type: "web".to_string(),
            port: 8000,
            health_check_path: "/health".to_string(),
            load_balancer: LoadBalancerConfig {
                strategy: LoadBalancingStrategy::RoundRobin,
                min_instances: 2,
                max_instances: 5,
            },
            ssl_enabled: true,
            auto_scaling: true,
            circuit_breaker_enabled: true,
            deployment_strategy: DeploymentStrategy::BlueGreen,
        }
    }

    // ── Endpoint CRUD ──────────────────────────────────────────────

    #[test]
    fn endpoint_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let endpoint = test_endpoint("api");

        store.put_endpoint(&endpoint).unwrap();
        assert_eq!(store.get_endpoint("api").unwrap(), Some(endpoint));
        assert!(store.get_endpoint("nope").unwrap().is_none());
    }

    #[test]
    fn endpoint_upsert_replaces_row() {
        let store = StateStore::open_in_memory().unwrap();
        let mut endpoint = test_endpoint("api");
        store.put_endpoint(&endpoint).unwrap();

        endpoint.load_balancer.max_instances = 20;
        store.put_endpoint(&endpoint).unwrap();

        let all = store.list_endpoints().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].load_balancer.max_instances, 20);
    }

    // ── Instance CRUD ──────────────────────────────────────────────

    #[test]
    fn instance_list_for_endpoint() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&ServiceInstance::new("api", "localhost", 8001, "v1")).unwrap();
        store.put_instance(&ServiceInstance::new("api", "localhost", 8002, "v1")).unwrap();
        store.put_instance(&ServiceInstance::new("web", "localhost", 9001, "v1")).unwrap();

        assert_eq!(store.list_instances_for_endpoint("api").unwrap().len(), 2);
        assert_eq!(store.list_instances_for_endpoint("web").unwrap().len(), 1);
        assert_eq!(store.list_instances().unwrap().len(), 3);
    }

    #[test]
    fn instance_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let inst = ServiceInstance::new("api", "localhost", 8001, "v1");
        store.put_instance(&inst).unwrap();

        assert!(store.delete_instance(&inst.instance_id).unwrap());
        assert!(!store.delete_instance(&inst.instance_id).unwrap());
        assert!(store.get_instance(&inst.instance_id).unwrap().is_none());
    }

    // ── Deployment CRUD ────────────────────────────────────────────

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let mut deployment = DeploymentStatus::new("api", DeploymentStrategy::Canary, None, "v2");
        store.put_deployment(&deployment).unwrap();

        deployment.begin();
        deployment.advance_progress(25);
        store.put_deployment(&deployment).unwrap();

        let stored = store.get_deployment(&deployment.deployment_id).unwrap().unwrap();
        assert_eq!(stored.status, DeploymentState::Deploying);
        assert_eq!(stored.progress_percentage, 25);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");
        let deployment = DeploymentStatus::new("api", DeploymentStrategy::Rolling, None, "v2");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_endpoint(&test_endpoint("api")).unwrap();
            store.put_deployment(&deployment).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_endpoint("api").unwrap().is_some());
        assert_eq!(store.get_deployment(&deployment.deployment_id).unwrap(), Some(deployment));
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_endpoints().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(!store.delete_instance("nope").unwrap());
    }
}
