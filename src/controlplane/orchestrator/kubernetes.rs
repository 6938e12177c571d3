//! Kubernetes Orchestrator
//!
//! Projects declared objects into a Kubernetes cluster with server-side apply
//! and reads back what the database operators report. Engine descriptors,
//! storage classes and node capacity come straight from the API server.

use crate::controlplane::validation::Quantity;
use crate::crd::{
    BackupStorage, BackupStorageSpec, DatabaseCluster, DatabaseClusterBackup,
    DatabaseClusterRestore, DatabaseEngine,
};
use crate::domain::ports::{
    BackupStorageProjection, ClusterInfo, ClusterOrchestrator, ClusterResources, ObjectKind,
    ObjectRef, ResourceAmounts,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "dbaas-control-plane";

/// Configuration for the Kubernetes orchestrator
#[derive(Debug, Clone)]
pub struct KubeOrchestratorConfig {
    pub field_manager: String,
    /// Reported when node metadata does not reveal the distribution
    pub default_cluster_type: String,
}

impl Default for KubeOrchestratorConfig {
    fn default() -> Self {
        Self {
            field_manager: FIELD_MANAGER.to_string(),
            default_cluster_type: "generic".to_string(),
        }
    }
}

/// Orchestrator backed by a Kubernetes API server
pub struct KubeOrchestrator {
    client: Client,
    config: KubeOrchestratorConfig,
}

impl KubeOrchestrator {
    pub fn new(client: Client, config: KubeOrchestratorConfig) -> Self {
        Self { client, config }
    }

    /// Connect using the ambient kubeconfig or in-cluster credentials
    pub async fn try_default(config: KubeOrchestratorConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    /// Connect with the current context of a kubeconfig file
    pub async fn from_kubeconfig(path: &Path, config: KubeOrchestratorConfig) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::Configuration(format!("cannot read kubeconfig {}: {}", path.display(), e))
        })?;
        let client_config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Configuration(format!("invalid kubeconfig: {}", e)))?;
        let client = Client::try_from(client_config)?;
        Ok(Self::new(client, config))
    }

    fn api_resource(kind: ObjectKind) -> ApiResource {
        match kind {
            ObjectKind::DatabaseCluster => ApiResource::erase::<DatabaseCluster>(&()),
            ObjectKind::DatabaseClusterBackup => ApiResource::erase::<DatabaseClusterBackup>(&()),
            ObjectKind::DatabaseClusterRestore => {
                ApiResource::erase::<DatabaseClusterRestore>(&())
            }
            ObjectKind::BackupStorage => ApiResource::erase::<BackupStorage>(&()),
        }
    }

    fn dynamic_api(&self, kind: ObjectKind, namespace: &str) -> (Api<DynamicObject>, ApiResource) {
        let resource = Self::api_resource(kind);
        let api = Api::namespaced_with(self.client.clone(), namespace, &resource);
        (api, resource)
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.config.field_manager).force()
    }

    /// Guess the distribution from node metadata
    fn detect_cluster_type(&self, nodes: &[Node]) -> String {
        for node in nodes {
            let provider = node
                .spec
                .as_ref()
                .and_then(|s| s.provider_id.as_deref())
                .unwrap_or_default();
            if provider.starts_with("aws://") {
                return "eks".to_string();
            }
            let labels = node.metadata.labels.as_ref();
            if labels.map_or(false, |l| l.contains_key("minikube.k8s.io/name")) {
                return "minikube".to_string();
            }
        }
        self.config.default_cluster_type.clone()
    }
}

#[async_trait]
impl ClusterOrchestrator for KubeOrchestrator {
    fn orchestrator_name(&self) -> &str {
        "kubernetes"
    }

    async fn apply(&self, object: &ObjectRef, manifest: Value) -> Result<()> {
        let (api, resource) = self.dynamic_api(object.kind, &object.namespace);

        let mut manifest = manifest;
        let map = manifest.as_object_mut().ok_or_else(|| {
            Error::Internal(format!("manifest for {} is not an object", object))
        })?;
        map.insert("apiVersion".into(), json!(resource.api_version));
        map.insert("kind".into(), json!(resource.kind));
        map.remove("status");

        api.patch(&object.name, &self.apply_params(), &Patch::Apply(&manifest))
            .await?;
        debug!("Applied {}", object);
        Ok(())
    }

    async fn apply_backup_storage(
        &self,
        namespace: &str,
        storage: &BackupStorageProjection,
    ) -> Result<()> {
        let secret_name = format!("{}-secret", storage.name);

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([
                ("AWS_ACCESS_KEY_ID".to_string(), storage.access_key.clone()),
                ("AWS_SECRET_ACCESS_KEY".to_string(), storage.secret_key.clone()),
            ])),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        secrets
            .patch(&secret_name, &self.apply_params(), &Patch::Apply(&secret))
            .await?;

        let api: Api<BackupStorage> = Api::namespaced(self.client.clone(), namespace);
        let mut object = BackupStorage::new(
            &storage.name,
            BackupStorageSpec {
                r#type: storage.storage_type.clone(),
                bucket: storage.bucket_name.clone(),
                region: storage.region.clone(),
                endpoint_url: storage.url.clone(),
                credentials_secret_name: secret_name,
            },
        );
        object.metadata.namespace = Some(namespace.to_string());
        api.patch(&storage.name, &self.apply_params(), &Patch::Apply(&object))
            .await?;

        info!("Projected backup storage {} into {}", storage.name, namespace);
        Ok(())
    }

    async fn remove(&self, object: &ObjectRef) -> Result<()> {
        let (api, _) = self.dynamic_api(object.kind, &object.namespace);
        match api.delete(&object.name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ref e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        if object.kind == ObjectKind::BackupStorage {
            let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &object.namespace);
            let secret_name = format!("{}-secret", object.name);
            match secrets.delete(&secret_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ref e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Removed {}", object);
        Ok(())
    }

    async fn observed_status(&self, object: &ObjectRef) -> Result<Option<Value>> {
        let (api, _) = self.dynamic_api(object.kind, &object.namespace);
        let found = api.get_opt(&object.name).await?;
        Ok(found
            .and_then(|o| o.data.get("status").cloned())
            .filter(|status| !status.is_null()))
    }

    async fn list_objects(&self, kind: ObjectKind, namespace: &str) -> Result<Vec<Value>> {
        let (api, _) = self.dynamic_api(kind, namespace);
        let list = api.list(&ListParams::default()).await?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .collect()
    }

    async fn list_engines(&self, namespace: &str) -> Result<Vec<DatabaseEngine>> {
        let api: Api<DatabaseEngine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_engine(&self, namespace: &str, name: &str) -> Result<Option<DatabaseEngine>> {
        let api: Api<DatabaseEngine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn update_engine_allowed_versions(
        &self,
        namespace: &str,
        name: &str,
        allowed_versions: Vec<String>,
    ) -> Result<DatabaseEngine> {
        let api: Api<DatabaseEngine> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "allowedVersions": allowed_versions } });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(engine) => Ok(engine),
            Err(kube::Error::Api(ref e)) if e.code == 404 => {
                Err(Error::not_found("DatabaseEngine", name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cluster_info(&self) -> Result<ClusterInfo> {
        let classes: Api<StorageClass> = Api::all(self.client.clone());
        let storage_class_names = classes
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect();

        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes.list(&ListParams::default()).await?.items;

        Ok(ClusterInfo {
            cluster_type: self.detect_cluster_type(&nodes),
            storage_class_names,
        })
    }

    async fn cluster_resources(&self) -> Result<ClusterResources> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut capacity = ResourceAmounts::default();
        for node in nodes.list(&ListParams::default()).await?.items {
            let allocatable = node.status.and_then(|s| s.allocatable).unwrap_or_default();
            capacity = capacity.saturating_add(&ResourceAmounts {
                cpu_millis: quantity_millis(allocatable.get("cpu")),
                memory_bytes: quantity_units(allocatable.get("memory")),
                disk_size: quantity_units(allocatable.get("ephemeral-storage")),
            });
        }

        let mut consumed = ResourceAmounts::default();
        let pods: Api<Pod> = Api::all(self.client.clone());
        let running = ListParams::default()
            .fields("status.phase!=Succeeded,status.phase!=Failed");
        for pod in pods.list(&running).await?.items {
            let containers = pod.spec.map(|s| s.containers).unwrap_or_default();
            for container in containers {
                let requests = container
                    .resources
                    .and_then(|r| r.requests)
                    .unwrap_or_default();
                consumed = consumed.saturating_add(&ResourceAmounts {
                    cpu_millis: quantity_millis(requests.get("cpu")),
                    memory_bytes: quantity_units(requests.get("memory")),
                    disk_size: 0,
                });
            }
        }

        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        for claim in claims.list(&ListParams::default()).await?.items {
            let requested = claim
                .spec
                .and_then(|s| s.resources)
                .and_then(|r| r.requests)
                .unwrap_or_default();
            consumed.disk_size = consumed
                .disk_size
                .saturating_add(quantity_units(requested.get("storage")));
        }

        Ok(ClusterResources {
            capacity,
            available: capacity.saturating_sub(&consumed),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.apiserver_version().await {
            Ok(version) => {
                debug!("API server {}.{}", version.major, version.minor);
                Ok(true)
            }
            Err(e) => {
                warn!("API server health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

fn parse_k8s_quantity(quantity: Option<&K8sQuantity>) -> Option<Quantity> {
    quantity.and_then(|q| q.0.parse::<Quantity>().ok())
}

fn quantity_millis(quantity: Option<&K8sQuantity>) -> u64 {
    parse_k8s_quantity(quantity)
        .and_then(|q| u64::try_from(q.as_millis()).ok())
        .unwrap_or(0)
}

fn quantity_units(quantity: Option<&K8sQuantity>) -> u64 {
    parse_k8s_quantity(quantity)
        .and_then(|q| u64::try_from(q.as_units()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_resources() {
        let resource = KubeOrchestrator::api_resource(ObjectKind::DatabaseCluster);
        assert_eq!(resource.api_version, "dbaas.controlplane.io/v1alpha1");
        assert_eq!(resource.plural, "databaseclusters");

        let resource = KubeOrchestrator::api_resource(ObjectKind::BackupStorage);
        assert_eq!(resource.kind, "BackupStorage");
    }

    #[test]
    fn test_quantity_conversion() {
        let cpu = K8sQuantity("3920m".into());
        assert_eq!(quantity_millis(Some(&cpu)), 3920);
        let memory = K8sQuantity("16Gi".into());
        assert_eq!(quantity_units(Some(&memory)), 16 * 1024 * 1024 * 1024);
        assert_eq!(quantity_units(None), 0);
        assert_eq!(quantity_units(Some(&K8sQuantity("bogus".into()))), 0);
    }
}
