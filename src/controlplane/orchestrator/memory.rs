//! In-memory Orchestrator
//!
//! Mirrors applied objects in process. Serves standalone deployments and
//! tests; optionally simulates the reconciling operators by reporting a
//! status some time after each apply.

use crate::controlplane::validation::Quantity;
use crate::crd::{
    AvailableVersions, Component, DatabaseEngine, DatabaseEngineSpec, DatabaseEngineStatus,
    EngineType,
};
use crate::domain::ports::{
    BackupStorageProjection, ClusterInfo, ClusterOrchestrator, ClusterResources, ObjectKind,
    ObjectRef, ResourceAmounts,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the in-memory orchestrator
#[derive(Debug, Clone)]
pub struct InMemoryOrchestratorConfig {
    pub cluster_type: String,
    pub storage_class_names: Vec<String>,
    /// Total capacity reported by `cluster_resources`
    pub capacity: ResourceAmounts,
    /// Report a status this long after each apply
    pub simulate_reconcile: Option<Duration>,
}

impl Default for InMemoryOrchestratorConfig {
    fn default() -> Self {
        Self {
            cluster_type: "generic".to_string(),
            storage_class_names: vec!["standard".to_string()],
            capacity: ResourceAmounts {
                cpu_millis: 16_000,
                memory_bytes: 64 * 1024 * 1024 * 1024,
                disk_size: 1024 * 1024 * 1024 * 1024,
            },
            simulate_reconcile: None,
        }
    }
}

// =============================================================================
// Object State
// =============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    manifest: Value,
    status: Option<Value>,
}

type ObjectMap = BTreeMap<ObjectRef, StoredObject>;

// =============================================================================
// In-memory Orchestrator
// =============================================================================

/// Orchestrator keeping every object in memory
pub struct InMemoryOrchestrator {
    config: InMemoryOrchestratorConfig,
    objects: Arc<RwLock<ObjectMap>>,
    backup_storages: RwLock<BTreeMap<(String, String), BackupStorageProjection>>,
    /// Engine catalogs by namespace, seeded on first access
    engines: RwLock<BTreeMap<String, BTreeMap<String, DatabaseEngine>>>,
    /// Calls to fail with `OrchestratorUnavailable` before succeeding again
    pending_failures: AtomicU32,
    applies: AtomicU64,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::with_config(InMemoryOrchestratorConfig::default())
    }

    pub fn with_config(config: InMemoryOrchestratorConfig) -> Self {
        Self {
            config,
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            backup_storages: RwLock::new(BTreeMap::new()),
            engines: RwLock::new(BTreeMap::new()),
            pending_failures: AtomicU32::new(0),
            applies: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Report a status for an object, as a reconciling operator would
    pub async fn record_status(&self, object: &ObjectRef, status: Value) -> Result<()> {
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(object)
            .ok_or_else(|| Error::not_found(object.kind.to_string(), &object.name))?;
        stored.status = Some(status);
        Ok(())
    }

    /// Drop an object without going through `remove`
    pub async fn forget(&self, object: &ObjectRef) {
        self.objects.write().await.remove(object);
    }

    /// Fail the next `count` mutating calls as unavailable
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Manifest last applied for an object
    pub async fn applied(&self, object: &ObjectRef) -> Option<Value> {
        self.objects
            .read()
            .await
            .get(object)
            .map(|stored| stored.manifest.clone())
    }

    pub async fn backup_storage(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<BackupStorageProjection> {
        self.backup_storages
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Successful applies so far
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::Relaxed)
    }

    fn take_failure(&self, operation: &str) -> Result<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::OrchestratorUnavailable(format!(
                "{} failed: injected failure",
                operation
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reconcile simulation
    // -------------------------------------------------------------------------

    fn schedule_reconcile(&self, object: ObjectRef, manifest: &Value) {
        let Some(delay) = self.config.simulate_reconcile else {
            return;
        };
        let status = simulated_status(&object, manifest);
        let objects = self.objects.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(stored) = objects.write().await.get_mut(&object) {
                debug!("Simulated reconcile of {}", object);
                stored.status = Some(status);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Engine catalog
    // -------------------------------------------------------------------------

    async fn with_engines<R>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut BTreeMap<String, DatabaseEngine>) -> R,
    ) -> R {
        let mut engines = self.engines.write().await;
        let catalog = engines
            .entry(namespace.to_string())
            .or_insert_with(|| default_engines(namespace));
        f(catalog)
    }

    /// Resources requested by every applied cluster
    async fn consumed(&self) -> ResourceAmounts {
        let objects = self.objects.read().await;
        objects
            .iter()
            .filter(|(object, _)| object.kind == ObjectKind::DatabaseCluster)
            .map(|(_, stored)| cluster_footprint(&stored.manifest))
            .fold(ResourceAmounts::default(), |acc, r| acc.saturating_add(&r))
    }
}

impl Default for InMemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterOrchestrator for InMemoryOrchestrator {
    fn orchestrator_name(&self) -> &str {
        "in-memory"
    }

    async fn apply(&self, object: &ObjectRef, manifest: Value) -> Result<()> {
        self.take_failure("apply")?;
        debug!("Applying {}", object);

        self.schedule_reconcile(object.clone(), &manifest);
        let mut objects = self.objects.write().await;
        match objects.get_mut(object) {
            Some(stored) => stored.manifest = manifest,
            None => {
                objects.insert(
                    object.clone(),
                    StoredObject {
                        manifest,
                        status: None,
                    },
                );
            }
        }
        self.applies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn apply_backup_storage(
        &self,
        namespace: &str,
        storage: &BackupStorageProjection,
    ) -> Result<()> {
        self.take_failure("apply backup storage")?;
        info!("Projecting backup storage {} into {}", storage.name, namespace);

        self.backup_storages
            .write()
            .await
            .insert((namespace.to_string(), storage.name.clone()), storage.clone());
        let object = ObjectRef::new(ObjectKind::BackupStorage, namespace, &storage.name);
        self.objects.write().await.insert(
            object,
            StoredObject {
                manifest: json!({
                    "metadata": { "name": storage.name, "namespace": namespace },
                    "spec": {
                        "type": storage.storage_type,
                        "bucket": storage.bucket_name,
                        "region": storage.region,
                        "endpointURL": storage.url,
                        "credentialsSecretName": format!("{}-secret", storage.name),
                    }
                }),
                status: None,
            },
        );
        self.applies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, object: &ObjectRef) -> Result<()> {
        self.take_failure("remove")?;
        debug!("Removing {}", object);

        if object.kind == ObjectKind::BackupStorage {
            self.backup_storages
                .write()
                .await
                .remove(&(object.namespace.clone(), object.name.clone()));
        }
        self.objects.write().await.remove(object);
        Ok(())
    }

    async fn observed_status(&self, object: &ObjectRef) -> Result<Option<Value>> {
        Ok(self
            .objects
            .read()
            .await
            .get(object)
            .and_then(|stored| stored.status.clone()))
    }

    async fn list_objects(&self, kind: ObjectKind, namespace: &str) -> Result<Vec<Value>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(object, _)| object.kind == kind && object.namespace == namespace)
            .map(|(_, stored)| {
                let mut manifest = stored.manifest.clone();
                if let (Some(status), Some(map)) = (&stored.status, manifest.as_object_mut()) {
                    map.insert("status".into(), status.clone());
                }
                manifest
            })
            .collect())
    }

    async fn list_engines(&self, namespace: &str) -> Result<Vec<DatabaseEngine>> {
        Ok(self
            .with_engines(namespace, |catalog| catalog.values().cloned().collect())
            .await)
    }

    async fn get_engine(&self, namespace: &str, name: &str) -> Result<Option<DatabaseEngine>> {
        Ok(self
            .with_engines(namespace, |catalog| catalog.get(name).cloned())
            .await)
    }

    async fn update_engine_allowed_versions(
        &self,
        namespace: &str,
        name: &str,
        allowed_versions: Vec<String>,
    ) -> Result<DatabaseEngine> {
        self.take_failure("update engine")?;
        self.with_engines(namespace, |catalog| {
            let engine = catalog
                .get_mut(name)
                .ok_or_else(|| Error::not_found("DatabaseEngine", name))?;
            engine.spec.allowed_versions = allowed_versions;
            Ok(engine.clone())
        })
        .await
    }

    async fn cluster_info(&self) -> Result<ClusterInfo> {
        Ok(ClusterInfo {
            cluster_type: self.config.cluster_type.clone(),
            storage_class_names: self.config.storage_class_names.clone(),
        })
    }

    async fn cluster_resources(&self) -> Result<ClusterResources> {
        let capacity = self.config.capacity;
        let consumed = self.consumed().await;
        Ok(ClusterResources {
            capacity,
            available: capacity.saturating_sub(&consumed),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn quantity_at(manifest: &Value, pointer: &str) -> Option<Quantity> {
    manifest
        .pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Quantity>().ok())
}

/// CPU, memory and disk a cluster manifest requests across its replicas
fn cluster_footprint(manifest: &Value) -> ResourceAmounts {
    let replicas = manifest
        .pointer("/spec/engine/replicas")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    let per_replica = |pointer: &str, millis: bool| -> u64 {
        quantity_at(manifest, pointer)
            .map(|q| if millis { q.as_millis() } else { q.as_units() })
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0)
    };
    ResourceAmounts {
        cpu_millis: per_replica("/spec/engine/resources/cpu", true).saturating_mul(replicas),
        memory_bytes: per_replica("/spec/engine/resources/memory", false).saturating_mul(replicas),
        disk_size: per_replica("/spec/engine/storage/size", false).saturating_mul(replicas),
    }
}

fn simulated_status(object: &ObjectRef, manifest: &Value) -> Value {
    match object.kind {
        ObjectKind::DatabaseCluster => {
            let replicas = manifest
                .pointer("/spec/engine/replicas")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let port = match manifest.pointer("/spec/engine/type").and_then(Value::as_str) {
                Some("psmdb") => 27017,
                Some("postgresql") => 5432,
                _ => 3306,
            };
            json!({
                "status": "ready",
                "size": replicas,
                "ready": replicas,
                "hostname": format!("{}.{}.svc", object.name, object.namespace),
                "port": port,
            })
        }
        ObjectKind::DatabaseClusterBackup => json!({
            "state": "Succeeded",
            "destination": format!("s3://{}/{}", object.namespace, object.name),
        }),
        ObjectKind::DatabaseClusterRestore => json!({ "state": "Succeeded" }),
        ObjectKind::BackupStorage => json!({}),
    }
}

fn component(image: &str, status: &str) -> Component {
    Component {
        image_hash: format!("{:012x}", image_digest(image)),
        image_path: image.to_string(),
        status: status.to_string(),
    }
}

/// Stable short hash for seeded image hashes
fn image_digest(s: &str) -> u64 {
    s.bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        })
        & 0xffff_ffff_ffff
}

/// Catalog of the three supported operators
fn default_engines(namespace: &str) -> BTreeMap<String, DatabaseEngine> {
    let catalog: [(EngineType, &str, &[&str], &str, &[&str], &[(&str, &str)]); 3] = [
        (
            EngineType::Pxc,
            "percona/percona-xtradb-cluster",
            &["8.0.32-24", "8.0.31-23", "5.7.42-31.65"],
            "percona/percona-xtrabackup",
            &["8.0.32-26", "2.4.28"],
            &[("haproxy", "2.6.12"), ("proxysql", "2.5.1")],
        ),
        (
            EngineType::Psmdb,
            "percona/percona-server-mongodb",
            &["6.0.5-4", "5.0.15-13", "4.4.19-19"],
            "percona/percona-backup-mongodb",
            &["2.1.0"],
            &[("mongos", "6.0.5-4")],
        ),
        (
            EngineType::Postgresql,
            "percona/percona-postgresql-operator",
            &["15.2", "14.7", "13.10"],
            "percona/percona-postgresql-operator",
            &["2.1.0"],
            &[("pgbouncer", "1.18.0")],
        ),
    ];

    catalog
        .into_iter()
        .map(|(engine_type, image, versions, backup_image, backups, proxies)| {
            let mut available = AvailableVersions::default();
            for (i, v) in versions.iter().enumerate() {
                let status = if i == 0 { "recommended" } else { "available" };
                available
                    .engine
                    .insert(v.to_string(), component(&format!("{}:{}", image, v), status));
            }
            for v in backups.iter() {
                available.backup.insert(
                    v.to_string(),
                    component(&format!("{}:{}", backup_image, v), "recommended"),
                );
            }
            for (proxy, v) in proxies.iter() {
                available.proxy.entry(proxy.to_string()).or_default().insert(
                    v.to_string(),
                    component(&format!("percona/{}:{}", proxy, v), "recommended"),
                );
            }

            let mut engine = DatabaseEngine::new(
                engine_type.operator_name(),
                DatabaseEngineSpec {
                    r#type: engine_type.to_string(),
                    allowed_versions: Vec::new(),
                },
            );
            engine.metadata.namespace = Some(namespace.to_string());
            engine.status = Some(DatabaseEngineStatus {
                status: "installed".to_string(),
                operator_version: Some("1.0.0".to_string()),
                available_versions: available,
            });
            (engine_type.operator_name().to_string(), engine)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_ref() -> ObjectRef {
        ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders")
    }

    #[tokio::test]
    async fn test_apply_and_observe() {
        let orchestrator = InMemoryOrchestrator::new();
        let object = cluster_ref();

        orchestrator
            .apply(&object, json!({ "spec": { "engine": { "type": "pxc" } } }))
            .await
            .unwrap();
        assert_eq!(orchestrator.observed_status(&object).await.unwrap(), None);

        orchestrator
            .record_status(&object, json!({ "status": "ready" }))
            .await
            .unwrap();
        let status = orchestrator.observed_status(&object).await.unwrap().unwrap();
        assert_eq!(status["status"], "ready");

        let listed = orchestrator
            .list_objects(ObjectKind::DatabaseCluster, "team-a")
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["status"]["status"], "ready");

        orchestrator.remove(&object).await.unwrap();
        orchestrator.remove(&object).await.unwrap();
        assert!(orchestrator.applied(&object).await.is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator.fail_next(2);
        let object = cluster_ref();
        assert!(orchestrator.apply(&object, json!({})).await.is_err());
        assert!(orchestrator.apply(&object, json!({})).await.is_err());
        assert!(orchestrator.apply(&object, json!({})).await.is_ok());
        assert_eq!(orchestrator.apply_count(), 1);
    }

    #[tokio::test]
    async fn test_seeded_engines() {
        let orchestrator = InMemoryOrchestrator::new();
        let engines = orchestrator.list_engines("team-a").await.unwrap();
        assert_eq!(engines.len(), 3);

        let pxc = orchestrator
            .get_engine("team-a", "percona-xtradb-cluster-operator")
            .await
            .unwrap()
            .unwrap();
        assert!(pxc.is_installed());
        assert!(pxc.offers_version("8.0.32-24"));

        let updated = orchestrator
            .update_engine_allowed_versions(
                "team-a",
                "percona-xtradb-cluster-operator",
                vec!["8.0.32-24".into()],
            )
            .await
            .unwrap();
        assert_eq!(updated.spec.allowed_versions, vec!["8.0.32-24"]);

        // other namespaces keep their own catalog
        let other = orchestrator
            .get_engine("team-b", "percona-xtradb-cluster-operator")
            .await
            .unwrap()
            .unwrap();
        assert!(other.spec.allowed_versions.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_resources_account_for_clusters() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator
            .apply(
                &cluster_ref(),
                json!({ "spec": { "engine": {
                    "type": "pxc",
                    "replicas": 3,
                    "storage": { "size": "1G" },
                    "resources": { "cpu": "1", "memory": "1G" }
                } } }),
            )
            .await
            .unwrap();

        let resources = orchestrator.cluster_resources().await.unwrap();
        assert_eq!(
            resources.capacity.cpu_millis - resources.available.cpu_millis,
            3000
        );
        assert_eq!(
            resources.capacity.disk_size - resources.available.disk_size,
            3_000_000_000
        );
    }

    #[tokio::test]
    async fn test_cluster_resources_saturate_near_int64() {
        let orchestrator = InMemoryOrchestrator::new();
        for name in ["big-1", "big-2"] {
            orchestrator
                .apply(
                    &ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", name),
                    json!({ "spec": { "engine": {
                        "type": "pxc",
                        "replicas": 3,
                        "storage": { "size": "9E" },
                        "resources": { "cpu": "9P", "memory": "9E" }
                    } } }),
                )
                .await
                .unwrap();
        }

        let resources = orchestrator.cluster_resources().await.unwrap();
        assert_eq!(resources.available.memory_bytes, 0);
        assert_eq!(resources.available.disk_size, 0);
        assert_eq!(resources.available.cpu_millis, 0);
    }

    #[tokio::test]
    async fn test_simulated_reconcile() {
        let orchestrator = InMemoryOrchestrator::with_config(InMemoryOrchestratorConfig {
            simulate_reconcile: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        let object = cluster_ref();
        orchestrator
            .apply(&object, json!({ "spec": { "engine": { "type": "psmdb", "replicas": 3 } } }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = orchestrator.observed_status(&object).await.unwrap().unwrap();
        assert_eq!(status["ready"], 3);
        assert_eq!(status["port"], 27017);
    }
}
