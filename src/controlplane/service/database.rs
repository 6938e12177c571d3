//! Scoped resource operations
//!
//! Database clusters, backups and restores share one lifecycle: the declared
//! body is checked, committed to the scope's registry and then projected to
//! the scope's orchestrator through the apply queue. Reads join the declared
//! record with the last observed status. Callers own the labels and
//! annotations of a record; every other metadata field belongs to the server.

use super::ControlPlane;
use crate::controlplane::references::{ReferenceChecker, Referenced};
use crate::controlplane::registry::{Record, ResourceRegistry, ResourceStore};
use crate::controlplane::scope::{ResolvedScope, Scope};
use crate::controlplane::validation::{
    self, check_envelope, check_name, shapes, validate, Mode, NamedKind, Shape,
};
use crate::crd::{
    DatabaseCluster, DatabaseClusterBackup, DatabaseClusterBackupSpec, DatabaseClusterRestore,
    DatabaseClusterRestoreSpec, DatabaseClusterSpec,
};
use crate::domain::ports::{ObjectKind, ObjectRef};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// =============================================================================
// Declared Resource Kinds
// =============================================================================

/// A custom resource declared through the API and projected to an orchestrator
#[async_trait]
pub trait DeclaredResource:
    Record + Resource<DynamicType = ()> + Serialize + DeserializeOwned
{
    const OBJECT: ObjectKind;
    const NAMED: NamedKind;

    fn shape() -> &'static Shape;

    fn registry(store: &ResourceStore) -> &ResourceRegistry<Self>;

    /// Build the record from a validated spec
    fn build(name: &str, spec: Value) -> Result<Self>;

    /// Backup storages the resource needs projected into its scope
    fn storage_names(&self) -> Vec<String>;

    /// Records that must not disappear while the resource is admitted
    fn referenced(&self) -> Referenced;

    /// References and kind-specific admission
    async fn admit(
        &self,
        control_plane: &ControlPlane,
        resolved: &ResolvedScope,
        previous: Option<&Self>,
    ) -> Result<()>;
}

fn spec_of<S: DeserializeOwned>(spec: Value) -> Result<S> {
    serde_json::from_value(spec).map_err(|e| Error::Schema(e.to_string()))
}

#[async_trait]
impl DeclaredResource for DatabaseCluster {
    const OBJECT: ObjectKind = ObjectKind::DatabaseCluster;
    const NAMED: NamedKind = NamedKind::DatabaseCluster;

    fn shape() -> &'static Shape {
        &shapes::DATABASE_CLUSTER
    }

    fn registry(store: &ResourceStore) -> &ResourceRegistry<Self> {
        &store.clusters
    }

    fn build(name: &str, spec: Value) -> Result<Self> {
        Ok(DatabaseCluster::new(name, spec_of::<DatabaseClusterSpec>(spec)?))
    }

    fn storage_names(&self) -> Vec<String> {
        self.backup_storage_names()
    }

    fn referenced(&self) -> Referenced {
        Referenced::of_cluster(self)
    }

    async fn admit(
        &self,
        control_plane: &ControlPlane,
        resolved: &ResolvedScope,
        _previous: Option<&Self>,
    ) -> Result<()> {
        ReferenceChecker::new(control_plane.store()).check_cluster(resolved, self)?;

        let engine_type = validation::engine_type(self)?;
        let operator = engine_type.operator_name();
        let engine = resolved
            .orchestrator
            .get_engine(&resolved.namespace, operator)
            .await?
            .filter(|engine| engine.is_installed())
            .ok_or_else(|| {
                Error::ClusterSpecInvalid(format!("Database engine '{}' is not installed", operator))
            })?;
        validation::admit(self, &engine)
    }
}

#[async_trait]
impl DeclaredResource for DatabaseClusterBackup {
    const OBJECT: ObjectKind = ObjectKind::DatabaseClusterBackup;
    const NAMED: NamedKind = NamedKind::DatabaseClusterBackup;

    fn shape() -> &'static Shape {
        &shapes::DATABASE_CLUSTER_BACKUP
    }

    fn registry(store: &ResourceStore) -> &ResourceRegistry<Self> {
        &store.backups
    }

    fn build(name: &str, spec: Value) -> Result<Self> {
        Ok(DatabaseClusterBackup::new(
            name,
            spec_of::<DatabaseClusterBackupSpec>(spec)?,
        ))
    }

    fn storage_names(&self) -> Vec<String> {
        vec![self.spec.backup_storage_name.clone()]
    }

    fn referenced(&self) -> Referenced {
        Referenced::of_backup(self)
    }

    async fn admit(
        &self,
        control_plane: &ControlPlane,
        resolved: &ResolvedScope,
        _previous: Option<&Self>,
    ) -> Result<()> {
        ReferenceChecker::new(control_plane.store()).check_backup(resolved, self)
    }
}

#[async_trait]
impl DeclaredResource for DatabaseClusterRestore {
    const OBJECT: ObjectKind = ObjectKind::DatabaseClusterRestore;
    const NAMED: NamedKind = NamedKind::DatabaseClusterRestore;

    fn shape() -> &'static Shape {
        &shapes::DATABASE_CLUSTER_RESTORE
    }

    fn registry(store: &ResourceStore) -> &ResourceRegistry<Self> {
        &store.restores
    }

    fn build(name: &str, spec: Value) -> Result<Self> {
        let spec = spec_of::<DatabaseClusterRestoreSpec>(spec)?;
        if spec.data_source.is_empty() {
            return Err(Error::Validation(
                "dataSource should name either dbClusterBackupName or backupSource".into(),
            ));
        }
        Ok(DatabaseClusterRestore::new(name, spec))
    }

    fn storage_names(&self) -> Vec<String> {
        self.backup_storage_name()
            .map(|name| vec![name.to_string()])
            .unwrap_or_default()
    }

    fn referenced(&self) -> Referenced {
        Referenced::of_restore(self)
    }

    async fn admit(
        &self,
        control_plane: &ControlPlane,
        resolved: &ResolvedScope,
        previous: Option<&Self>,
    ) -> Result<()> {
        ReferenceChecker::new(control_plane.store()).check_restore(resolved, self, previous)
    }
}

// =============================================================================
// Operations
// =============================================================================

/// Metadata fields owned by the caller
#[derive(Debug, Default, Deserialize)]
struct DeclaredMetadata {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
}

impl DeclaredMetadata {
    fn from_body(body: &Value) -> Result<Self> {
        let Some(metadata) = body.get("metadata").and_then(Value::as_object) else {
            return Ok(Self::default());
        };
        let owned: Map<String, Value> = ["labels", "annotations"]
            .into_iter()
            .filter_map(|field| metadata.get(field).map(|v| (field.to_string(), v.clone())))
            .collect();
        serde_json::from_value(Value::Object(owned))
            .map_err(|e| Error::Schema(format!("metadata: {}", e)))
    }

    fn declare(self, meta: &mut ObjectMeta) {
        meta.labels = self.labels.filter(|labels| !labels.is_empty());
        meta.annotations = self.annotations.filter(|annotations| !annotations.is_empty());
    }
}

/// Check the envelope and the declared fields, returning the record it declares
fn checked_body<T: DeclaredResource>(body: &Value) -> Result<T> {
    let name = check_envelope(T::KIND.as_str(), body)?.to_string();
    validate(body, T::shape(), Mode::Create)?;
    check_name(T::NAMED, "metadata.name", &name)?;
    let metadata = DeclaredMetadata::from_body(body)?;
    let spec = body.get("spec").cloned().unwrap_or(Value::Null);

    let mut record = T::build(&name, spec)?;
    metadata.declare(record.meta_mut());
    Ok(record)
}

/// Declared form of an object read back from an orchestrator
fn declared_object(mut object: Value) -> Value {
    if let Some(map) = object.as_object_mut() {
        map.remove("status");
        if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
            metadata.retain(|field, _| {
                matches!(field.as_str(), "name" | "labels" | "annotations")
            });
        }
    }
    object
}

/// Manifest handed to the orchestrator
fn manifest<T: DeclaredResource>(record: &T, namespace: &str) -> Result<Value> {
    let mut manifest = serde_json::to_value(record)?;
    if let Some(map) = manifest.as_object_mut() {
        map.remove("status");
        if let Some(metadata) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("namespace".into(), Value::String(namespace.to_string()));
        }
    }
    Ok(manifest)
}

impl ControlPlane {
    pub async fn create_resource<T: DeclaredResource>(&self, scope: &Scope, body: Value) -> Result<Value> {
        let result = self.try_create_resource::<T>(scope, body).await;
        self.observed(T::KIND.as_str(), "create", result)
    }

    async fn try_create_resource<T: DeclaredResource>(&self, scope: &Scope, body: Value) -> Result<Value> {
        let resolved = self.resolver.resolve(scope)?;
        let record = checked_body::<T>(&body)?;
        let name = record.name().to_string();

        let references = record.referenced().lease(&self.store, &resolved.scope).await;
        let registry = T::registry(&self.store);
        let lease = registry.lock(&resolved.scope, &name).await;
        record.admit(self, &resolved, None).await?;
        let entry = registry.create(&lease, record)?;

        // Queued while the lease is held so projections keep commit order
        let object = ObjectRef::new(T::OBJECT, &resolved.namespace, &name);
        self.queue.apply(
            resolved.orchestrator.clone(),
            object,
            manifest(&entry.record, &resolved.namespace)?,
        )?;
        self.project_storages(&resolved, &entry.record.storage_names())
            .await?;
        drop(lease);
        drop(references);

        info!("Created {} {} in {}", T::KIND, name, scope);
        self.projector
            .project(&resolved, T::OBJECT, &name, &entry.record)
            .await
    }

    pub async fn get_resource<T: DeclaredResource>(&self, scope: &Scope, name: &str) -> Result<Value> {
        let result = self.try_get_resource::<T>(scope, name).await;
        self.observed(T::KIND.as_str(), "get", result)
    }

    async fn try_get_resource<T: DeclaredResource>(&self, scope: &Scope, name: &str) -> Result<Value> {
        let resolved = self.resolver.resolve(scope)?;
        let entry = T::registry(&self.store).get(&resolved.scope, name)?;
        self.projector
            .project(&resolved, T::OBJECT, name, &entry.record)
            .await
    }

    /// Records of a scope, optionally only those owned by a cluster
    pub async fn list_resources<T: DeclaredResource>(
        &self,
        scope: &Scope,
        owner: Option<&str>,
    ) -> Result<Vec<Value>> {
        let resolved = self.resolver.resolve(scope)?;
        let entries = T::registry(&self.store).list(&resolved.scope, owner);
        debug!("Listing {} {} records in {}", entries.len(), T::KIND, scope);

        let projections = entries.iter().map(|entry| {
            self.projector
                .project(&resolved, T::OBJECT, &entry.name, &entry.record)
        });
        futures::future::try_join_all(projections).await
    }

    /// Replace the declared spec of an existing resource
    pub async fn replace_resource<T: DeclaredResource>(
        &self,
        scope: &Scope,
        name: &str,
        body: Value,
    ) -> Result<Value> {
        let result = self.try_replace_resource::<T>(scope, name, body).await;
        self.observed(T::KIND.as_str(), "update", result)
    }

    async fn try_replace_resource<T: DeclaredResource>(
        &self,
        scope: &Scope,
        name: &str,
        body: Value,
    ) -> Result<Value> {
        let resolved = self.resolver.resolve(scope)?;
        let record = checked_body::<T>(&body)?;
        if record.name() != name {
            return Err(Error::Validation(format!(
                "metadata.name '{}' does not match '{}' in the request path",
                record.name(),
                name
            )));
        }

        let references = record.referenced().lease(&self.store, &resolved.scope).await;
        let registry = T::registry(&self.store);
        let lease = registry.lock(&resolved.scope, name).await;
        let previous = registry.get(&resolved.scope, name)?.record;
        record.admit(self, &resolved, Some(&previous)).await?;
        let entry = registry.update(&lease, record)?;

        let object = ObjectRef::new(T::OBJECT, &resolved.namespace, name);
        self.queue.apply(
            resolved.orchestrator.clone(),
            object,
            manifest(&entry.record, &resolved.namespace)?,
        )?;

        let current = entry.record.storage_names();
        let dropped: Vec<String> = previous
            .storage_names()
            .into_iter()
            .filter(|n| !current.contains(n))
            .collect();
        self.project_storages(&resolved, &current).await?;
        self.release_storages(&resolved, &dropped).await?;
        drop(lease);
        drop(references);

        info!("Updated {} {} in {}", T::KIND, name, scope);
        self.projector
            .project(&resolved, T::OBJECT, name, &entry.record)
            .await
    }

    /// Delete a resource, returning its last declared body
    pub async fn delete_resource<T: DeclaredResource>(&self, scope: &Scope, name: &str) -> Result<Value> {
        let result = self.try_delete_resource::<T>(scope, name).await;
        self.observed(T::KIND.as_str(), "delete", result)
    }

    async fn try_delete_resource<T: DeclaredResource>(&self, scope: &Scope, name: &str) -> Result<Value> {
        let resolved = self.resolver.resolve(scope)?;
        let registry = T::registry(&self.store);
        let lease = registry.lock(&resolved.scope, name).await;
        let entry = registry.delete(&lease)?;

        let object = ObjectRef::new(T::OBJECT, &resolved.namespace, name);
        self.queue.remove(resolved.orchestrator.clone(), object)?;
        self.release_storages(&resolved, &entry.record.storage_names())
            .await?;
        drop(lease);

        self.projector.evict(&resolved.scope, T::OBJECT, name);
        info!("Deleted {} {} in {}", T::KIND, name, scope);

        let mut body = serde_json::to_value(&entry.record)?;
        if let Some(map) = body.as_object_mut() {
            map.remove("status");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Startup hydration
    // -------------------------------------------------------------------------

    /// Insert objects the orchestrator already holds into the registry
    pub async fn hydrate(&self) -> Result<usize> {
        let mut hydrated = 0;
        for resolved in self.resolver.known_scopes() {
            hydrated += self.hydrate_kind::<DatabaseCluster>(&resolved).await?;
            hydrated += self.hydrate_kind::<DatabaseClusterBackup>(&resolved).await?;
            hydrated += self.hydrate_kind::<DatabaseClusterRestore>(&resolved).await?;
        }
        if hydrated > 0 {
            info!("Hydrated {} records from the orchestrator", hydrated);
        }
        Ok(hydrated)
    }

    async fn hydrate_kind<T: DeclaredResource>(&self, resolved: &ResolvedScope) -> Result<usize> {
        let objects = resolved
            .orchestrator
            .list_objects(T::OBJECT, &resolved.namespace)
            .await?;
        let registry = T::registry(&self.store);

        let mut hydrated = 0;
        for object in objects {
            let record: T = match serde_json::from_value(declared_object(object)) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable {} in {}: {}", T::KIND, resolved.scope, e);
                    continue;
                }
            };
            let lease = registry.lock(&resolved.scope, record.name()).await;
            if registry.contains(&resolved.scope, record.name()) {
                continue;
            }
            registry.create(&lease, record)?;
            hydrated += 1;
        }
        Ok(hydrated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, harness_with};
    use super::*;
    use crate::controlplane::orchestrator::InMemoryOrchestrator;
    use crate::controlplane::scope::{ClusterRegistration, ScopeResolver};
    use crate::domain::ports::ClusterOrchestrator;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn cluster_body(name: &str) -> Value {
        json!({
            "apiVersion": "dbaas.controlplane.io/v1alpha1",
            "kind": "DatabaseCluster",
            "metadata": { "name": name },
            "spec": {
                "engine": {
                    "type": "pxc",
                    "version": "8.0.32-24",
                    "replicas": 1,
                    "storage": { "size": "25G" },
                    "resources": { "cpu": "1", "memory": "1G" }
                },
                "proxy": { "type": "haproxy", "replicas": 1, "expose": { "type": "internal" } }
            }
        })
    }

    fn backup_body(name: &str, cluster: &str) -> Value {
        json!({
            "apiVersion": "dbaas.controlplane.io/v1alpha1",
            "kind": "DatabaseClusterBackup",
            "metadata": { "name": name },
            "spec": { "dbClusterName": cluster, "backupStorageName": "s3-a" }
        })
    }

    fn restore_body(name: &str, cluster: &str) -> Value {
        json!({
            "apiVersion": "dbaas.controlplane.io/v1alpha1",
            "kind": "DatabaseClusterRestore",
            "metadata": { "name": name },
            "spec": {
                "dbClusterName": cluster,
                "dataSource": { "dbClusterBackupName": "some-backup" }
            }
        })
    }

    fn ns(name: &str) -> Scope {
        Scope::Namespace(name.into())
    }

    #[tokio::test]
    async fn test_cluster_lifecycle() {
        let h = harness();
        let cp = &h.control_plane;
        let scope = ns("team-a");

        let created = cp
            .create_resource::<DatabaseCluster>(&scope, cluster_body("orders"))
            .await
            .unwrap();
        assert_eq!(created["metadata"]["name"], "orders");
        assert!(created.get("status").is_none());

        assert_matches!(
            cp.create_resource::<DatabaseCluster>(&scope, cluster_body("orders"))
                .await,
            Err(Error::ResourceExists { .. })
        );
        // same name in another scope is fine
        cp.create_resource::<DatabaseCluster>(&ns("team-b"), cluster_body("orders"))
            .await
            .unwrap();

        cp.queue().flush().await.unwrap();
        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        let applied = h.orchestrator.applied(&object).await.unwrap();
        assert_eq!(applied["metadata"]["namespace"], "team-a");

        cp.delete_resource::<DatabaseCluster>(&scope, "orders")
            .await
            .unwrap();
        assert_matches!(
            cp.get_resource::<DatabaseCluster>(&scope, "orders").await,
            Err(Error::ResourceNotFound { .. })
        );
        assert_matches!(
            cp.delete_resource::<DatabaseCluster>(&scope, "orders").await,
            Err(Error::ResourceNotFound { .. })
        );
        cp.queue().flush().await.unwrap();
        assert!(h.orchestrator.applied(&object).await.is_none());
    }

    #[tokio::test]
    async fn test_cluster_admission() {
        let cp = harness().control_plane;
        let scope = ns("team-a");

        let mut body = cluster_body("orders");
        body["spec"]["engine"]["type"] = json!("redis");
        let err = cp
            .create_resource::<DatabaseCluster>(&scope, body)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported database engine");

        let mut body = cluster_body("orders");
        body["spec"]["proxy"]["type"] = json!("mongos");
        let err = cp
            .create_resource::<DatabaseCluster>(&scope, body)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "You can use only either HAProxy or Proxy SQL for PXC clusters"
        );

        let mut body = cluster_body("orders");
        body["spec"]["engine"]["resources"]["cpu"] = json!(1);
        let err = cp
            .create_resource::<DatabaseCluster>(&scope, body)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("int64 data type is not supported"));

        let err = cp
            .create_resource::<DatabaseCluster>(&scope, cluster_body("a-very-long-cluster-name-1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "'metadata.name' can be at most 22 characters long"
        );

        let mut body = cluster_body("orders");
        body["spec"]["monitoring"] = json!({ "monitoringConfigName": "pmm-missing" });
        let err = cp
            .create_resource::<DatabaseCluster>(&scope, body)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "MonitoringInstance 'pmm-missing' is not found"
        );
    }

    #[tokio::test]
    async fn test_restore_references() {
        let cp = harness().control_plane;
        let scope = ns("team-a");

        let err = cp
            .create_resource::<DatabaseClusterRestore>(
                &scope,
                restore_body("restore", "not-existing-cluster"),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "DatabaseCluster 'not-existing-cluster' is not found"
        );

        let mut empty = restore_body("restore", "x");
        empty["spec"] = json!({});
        let err = cp
            .create_resource::<DatabaseClusterRestore>(&scope, empty)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "'Spec' field should not be empty");

        cp.create_resource::<DatabaseCluster>(&scope, cluster_body("orders"))
            .await
            .unwrap();
        cp.create_resource::<DatabaseClusterRestore>(&scope, restore_body("restore", "orders"))
            .await
            .unwrap();

        let err = cp
            .replace_resource::<DatabaseClusterRestore>(
                &scope,
                "restore",
                restore_body("restore", "not-existing-cluster"),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::ReferenceNotFound { .. });

        let err = cp
            .replace_resource::<DatabaseClusterRestore>(
                &scope,
                "restore",
                restore_body("other", "orders"),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }

    #[tokio::test]
    async fn test_filtered_lists() {
        let cp = harness().control_plane;
        let scope = ns("team-a");
        for cluster in ["cluster-a", "cluster-b"] {
            cp.create_resource::<DatabaseCluster>(&scope, cluster_body(cluster))
                .await
                .unwrap();
            for i in 1..=2 {
                cp.create_resource::<DatabaseClusterBackup>(
                    &scope,
                    backup_body(&format!("{}-backup-{}", cluster, i), cluster),
                )
                .await
                .unwrap();
            }
        }

        let all = cp
            .list_resources::<DatabaseClusterBackup>(&scope, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        let owned = cp
            .list_resources::<DatabaseClusterBackup>(&scope, Some("cluster-a"))
            .await
            .unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned
            .iter()
            .all(|b| b["spec"]["dbClusterName"] == "cluster-a"));
    }

    #[tokio::test]
    async fn test_unknown_scope() {
        let cp = harness().control_plane;
        let err = cp
            .list_resources::<DatabaseCluster>(&Scope::Cluster("nowhere".into()), None)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ScopeNotFound(_));
    }

    #[tokio::test]
    async fn test_status_appears_after_observation() {
        let h = harness();
        let cp = &h.control_plane;
        let scope = ns("team-a");
        cp.create_resource::<DatabaseCluster>(&scope, cluster_body("orders"))
            .await
            .unwrap();
        cp.queue().flush().await.unwrap();

        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        h.orchestrator
            .record_status(&object, json!({ "status": "ready", "size": 1, "ready": 1 }))
            .await
            .unwrap();
        let body = cp
            .get_resource::<DatabaseCluster>(&scope, "orders")
            .await
            .unwrap();
        assert_eq!(body["status"]["status"], "ready");
    }

    #[tokio::test]
    async fn test_hydrate_from_orchestrator() {
        let h = harness_with(|o| ScopeResolver::new(o, vec!["team-a".to_string()]));
        let cp = &h.control_plane;

        let mut declared = cluster_body("orders");
        declared["metadata"]["labels"] = json!({ "team": "payments" });
        let existing = checked_body::<DatabaseCluster>(&declared).unwrap();
        let mut object = manifest(&existing, "team-a").unwrap();
        object["metadata"]["uid"] = json!("0b5c6f1e-61a4-4b8e-9d7e-0e8f2d6c1a11");
        object["metadata"]["resourceVersion"] = json!("48213");
        object["metadata"]["generation"] = json!(3);
        object["metadata"]["creationTimestamp"] = json!("2024-05-02T09:12:44Z");
        object["metadata"]["managedFields"] =
            json!([{ "manager": "kubectl", "operation": "Update", "apiVersion": "v1" }]);
        object["status"] = json!({ "status": "ready" });
        h.orchestrator
            .apply(
                &ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders"),
                object,
            )
            .await
            .unwrap();

        assert_eq!(cp.hydrate().await.unwrap(), 1);
        let hydrated = DatabaseCluster::registry(cp.store())
            .get(&ns("team-a"), "orders")
            .unwrap()
            .record;
        assert_eq!(
            serde_json::to_value(&hydrated).unwrap(),
            serde_json::to_value(&existing).unwrap()
        );

        assert_matches!(
            cp.create_resource::<DatabaseCluster>(&ns("team-a"), cluster_body("orders"))
                .await,
            Err(Error::ResourceExists { .. })
        );
        // already registered records are left alone
        assert_eq!(cp.hydrate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_labels_and_annotations_round_trip() {
        let h = harness();
        let cp = &h.control_plane;
        let scope = ns("team-a");

        let mut body = cluster_body("orders");
        body["metadata"]["labels"] = json!({ "team": "payments", "tier": "gold" });
        body["metadata"]["annotations"] = json!({ "owner": "dba@example.com" });
        body["metadata"]["uid"] = json!("client-chosen");
        body["metadata"]["resourceVersion"] = json!("7");
        cp.create_resource::<DatabaseCluster>(&scope, body)
            .await
            .unwrap();

        let read = cp
            .get_resource::<DatabaseCluster>(&scope, "orders")
            .await
            .unwrap();
        assert_eq!(read["metadata"]["labels"]["team"], "payments");
        assert_eq!(read["metadata"]["labels"]["tier"], "gold");
        assert_eq!(read["metadata"]["annotations"]["owner"], "dba@example.com");
        assert!(read["metadata"].get("uid").is_none());
        assert!(read["metadata"].get("resourceVersion").is_none());

        cp.queue().flush().await.unwrap();
        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        let applied = h.orchestrator.applied(&object).await.unwrap();
        assert_eq!(applied["metadata"]["labels"]["team"], "payments");

        // replace declares the full set again
        let mut body = cluster_body("orders");
        body["metadata"]["labels"] = json!({ "team": "billing" });
        cp.replace_resource::<DatabaseCluster>(&scope, "orders", body)
            .await
            .unwrap();
        let read = cp
            .get_resource::<DatabaseCluster>(&scope, "orders")
            .await
            .unwrap();
        assert_eq!(read["metadata"]["labels"], json!({ "team": "billing" }));
        assert!(read["metadata"].get("annotations").is_none());

        let mut body = cluster_body("invalid");
        body["metadata"]["labels"] = json!({ "team": 1 });
        assert_matches!(
            cp.create_resource::<DatabaseCluster>(&scope, body).await,
            Err(Error::Schema(_))
        );
    }

    #[tokio::test]
    async fn test_restore_requires_data_source() {
        let cp = harness().control_plane;
        let scope = ns("team-a");
        cp.create_resource::<DatabaseCluster>(&scope, cluster_body("orders"))
            .await
            .unwrap();

        let mut body = restore_body("restore", "orders");
        body["spec"]["dataSource"] = json!({});
        let err = cp
            .create_resource::<DatabaseClusterRestore>(&scope, body)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));

        let mut body = restore_body("restore", "orders");
        body["spec"]["dataSource"] = json!({ "dbClusterBackupName": "" });
        assert_matches!(
            cp.create_resource::<DatabaseClusterRestore>(&scope, body).await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_legacy_alias_of_namespace_shares_records() {
        let h = harness_with(|o| {
            ScopeResolver::new(o.clone(), Vec::<String>::new()).with_cluster(
                ClusterRegistration {
                    id: "c-1".into(),
                    name: "main".into(),
                    namespace: "team-a".into(),
                },
                o,
            )
        });
        let cp = &h.control_plane;
        let legacy = Scope::Cluster("c-1".into());

        cp.create_resource::<DatabaseCluster>(&ns("team-a"), cluster_body("orders"))
            .await
            .unwrap();
        assert_matches!(
            cp.create_resource::<DatabaseCluster>(&legacy, cluster_body("orders"))
                .await,
            Err(Error::ResourceExists { .. })
        );
        let body = cp
            .get_resource::<DatabaseCluster>(&legacy, "orders")
            .await
            .unwrap();
        assert_eq!(body["metadata"]["name"], "orders");
        assert_eq!(
            cp.list_resources::<DatabaseCluster>(&legacy, None)
                .await
                .unwrap()
                .len(),
            1
        );

        cp.delete_resource::<DatabaseCluster>(&legacy, "orders")
            .await
            .unwrap();
        assert_matches!(
            cp.get_resource::<DatabaseCluster>(&ns("team-a"), "orders")
                .await,
            Err(Error::ResourceNotFound { .. })
        );
        cp.queue().flush().await.unwrap();
        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        assert!(h.orchestrator.applied(&object).await.is_none());
    }

    #[tokio::test]
    async fn test_failing_legacy_orchestrator_does_not_block_other_scopes() {
        let failing = Arc::new(InMemoryOrchestrator::new());
        failing.fail_next(1000);
        let legacy_orchestrator = failing.clone();
        let h = harness_with(move |o| {
            ScopeResolver::new(o, Vec::<String>::new()).with_cluster(
                ClusterRegistration {
                    id: "c-1".into(),
                    name: "staging".into(),
                    namespace: "dbaas".into(),
                },
                legacy_orchestrator,
            )
        });
        let cp = &h.control_plane;

        let legacy = Scope::Cluster("c-1".into());
        cp.create_resource::<DatabaseCluster>(&legacy, cluster_body("legacy"))
            .await
            .unwrap();
        cp.create_resource::<DatabaseCluster>(&ns("team-a"), cluster_body("orders"))
            .await
            .unwrap();

        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.orchestrator.applied(&object).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let stuck = ObjectRef::new(ObjectKind::DatabaseCluster, "dbaas", "legacy");
        assert!(failing.applied(&stuck).await.is_none());
    }

    #[tokio::test]
    async fn test_reference_delete_races_create() {
        let cp = harness().control_plane;
        let scope = ns("team-a");

        for i in 0..20 {
            let instance = format!("mon-{}", i);
            cp.create_monitoring_instance(json!({
                "type": "pmm",
                "name": instance,
                "url": "http://monitoring-instance",
                "pmm": { "apiKey": "abc" }
            }))
            .await
            .unwrap();

            let mut body = cluster_body(&format!("orders-{}", i));
            body["spec"]["monitoring"] = json!({ "monitoringConfigName": instance });
            let (created, deleted) = tokio::join!(
                cp.create_resource::<DatabaseCluster>(&scope, body),
                cp.delete_monitoring_instance(&instance)
            );
            match (created, deleted) {
                (Ok(_), Err(e)) => assert_matches!(e, Error::ResourceInUse { .. }),
                (Err(e), Ok(_)) => assert_matches!(e, Error::ReferenceNotFound { .. }),
                (created, deleted) => panic!(
                    "create ok: {}, delete ok: {}",
                    created.is_ok(),
                    deleted.is_ok()
                ),
            }
        }

        // a restore commits only while its cluster still exists
        for i in 0..20 {
            let cluster = format!("target-{}", i);
            cp.create_resource::<DatabaseCluster>(&scope, cluster_body(&cluster))
                .await
                .unwrap();
            let (restored, _) = tokio::join!(
                cp.create_resource::<DatabaseClusterRestore>(
                    &scope,
                    restore_body(&format!("restore-{}", i), &cluster)
                ),
                cp.delete_resource::<DatabaseCluster>(&scope, &cluster)
            );
            if let Err(e) = restored {
                assert_matches!(e, Error::ReferenceNotFound { .. });
            }
        }
    }
}
