//! Control Plane Service
//!
//! Ties the registry, secret store, prechecker, scope resolver, status
//! projector and apply queue together. Every write follows the same path:
//! resolve the scope, validate, check references, commit to the registry
//! under the record's write lease, then hand the projection to the queue.

pub mod backup_storage;
pub mod cluster;
pub mod database;
pub mod monitoring;

pub use backup_storage::{CreateBackupStorageRequest, PatchBackupStorageRequest};
pub use cluster::ClusterMonitoringRequest;
pub use database::DeclaredResource;
pub use monitoring::{CreateMonitoringInstanceRequest, PatchMonitoringInstanceRequest, PmmCredentials};

use crate::controlplane::metrics::ApiMetrics;
use crate::controlplane::orchestrator::ApplyQueue;
use crate::controlplane::projector::StatusProjector;
use crate::controlplane::registry::{BackupStorageRecord, ResourceStore};
use crate::controlplane::scope::{ResolvedScope, Scope, ScopeResolver};
use crate::domain::ports::{
    BackupStorageProjection, CredentialPrecheckerRef, ObjectKind, ObjectRef, SecretRef,
    SecretStoreRef,
};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Collaborators the control plane is built from
pub struct ControlPlaneDeps {
    pub resolver: ScopeResolver,
    pub secrets: SecretStoreRef,
    pub prechecker: CredentialPrecheckerRef,
    pub queue: ApplyQueue,
    pub metrics: Arc<ApiMetrics>,
}

/// The resource control plane
pub struct ControlPlane {
    store: Arc<ResourceStore>,
    secrets: SecretStoreRef,
    prechecker: CredentialPrecheckerRef,
    resolver: Arc<ScopeResolver>,
    projector: Arc<StatusProjector>,
    queue: ApplyQueue,
    metrics: Arc<ApiMetrics>,
    /// Monitoring instance each scope's cluster monitoring is bound to
    monitoring_bindings: DashMap<Scope, String>,
}

impl ControlPlane {
    pub fn new(deps: ControlPlaneDeps) -> Self {
        Self {
            store: Arc::new(ResourceStore::new()),
            secrets: deps.secrets,
            prechecker: deps.prechecker,
            resolver: Arc::new(deps.resolver),
            projector: Arc::new(StatusProjector::new()),
            queue: deps.queue,
            metrics: deps.metrics,
            monitoring_bindings: DashMap::new(),
        }
    }

    /// Start the tasks that follow registry events
    pub fn spawn_background(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.projector
            .clone()
            .spawn_evictor(self.store.subscribe(), shutdown)
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &ApiMetrics {
        &self.metrics
    }

    pub fn queue(&self) -> &ApplyQueue {
        &self.queue
    }

    /// Count the outcome of an operation and pass the result through
    fn observed<T>(&self, kind: &str, operation: &str, result: Result<T>) -> Result<T> {
        self.metrics.observe(kind, operation, result.is_ok());
        if let Err(e) = &result {
            debug!("{} {} rejected: {}", operation, kind, e);
        }
        result
    }

    /// Retire a secret that is no longer referenced
    async fn retire_secret(&self, reference: &SecretRef) {
        match self.secrets.delete(reference).await {
            Ok(()) | Err(Error::SecretNotFound(_)) => {}
            Err(e) => warn!("Could not retire secret {}: {}", reference, e),
        }
    }

    // -------------------------------------------------------------------------
    // Backup storage projections
    // -------------------------------------------------------------------------

    /// Whether anything declared in the scope still uses the storage
    fn storage_referenced_in(&self, scope: &Scope, storage: &str) -> bool {
        self.store
            .clusters
            .list(scope, None)
            .iter()
            .any(|e| e.record.backup_storage_names().iter().any(|n| n == storage))
            || self
                .store
                .backups
                .list(scope, None)
                .iter()
                .any(|e| e.record.spec.backup_storage_name == storage)
            || self
                .store
                .restores
                .list(scope, None)
                .iter()
                .any(|e| e.record.backup_storage_name() == Some(storage))
    }

    /// Scopes where the storage is used
    fn storage_referrers(&self, storage: &str) -> BTreeSet<Scope> {
        let clusters = self
            .store
            .clusters
            .list_all()
            .into_iter()
            .filter(|e| e.record.backup_storage_names().iter().any(|n| n == storage))
            .map(|e| e.scope);
        let backups = self
            .store
            .backups
            .list_all()
            .into_iter()
            .filter(|e| e.record.spec.backup_storage_name == storage)
            .map(|e| e.scope);
        let restores = self
            .store
            .restores
            .list_all()
            .into_iter()
            .filter(|e| e.record.backup_storage_name() == Some(storage))
            .map(|e| e.scope);
        clusters.chain(backups).chain(restores).collect()
    }

    async fn storage_projection(&self, record: &BackupStorageRecord) -> Result<BackupStorageProjection> {
        let (access_key, secret_key) = futures::try_join!(
            self.secrets.get(&record.access_key_id),
            self.secrets.get(&record.secret_key_id)
        )?;
        Ok(BackupStorageProjection {
            name: record.name.clone(),
            storage_type: record.storage_type.clone(),
            bucket_name: record.bucket_name.clone(),
            region: record.region.clone(),
            url: record.url.clone(),
            access_key,
            secret_key,
        })
    }

    /// Project existing storages into a scope
    async fn project_storages(&self, resolved: &ResolvedScope, names: &[String]) -> Result<()> {
        for name in names {
            let Some(entry) = self.store.backup_storages.find(&Scope::Global, name) else {
                continue;
            };
            let projection = self.storage_projection(&entry.record).await?;
            self.queue.apply_backup_storage(
                resolved.orchestrator.clone(),
                resolved.namespace.clone(),
                projection,
            )?;
        }
        Ok(())
    }

    /// Remove projections nothing in the scope uses any more
    async fn release_storages(&self, resolved: &ResolvedScope, names: &[String]) -> Result<()> {
        for name in names {
            if self.storage_referenced_in(&resolved.scope, name)
                || !self.store.backup_storages.contains(&Scope::Global, name)
            {
                continue;
            }
            let object = ObjectRef::new(ObjectKind::BackupStorage, &resolved.namespace, name);
            self.queue.remove(resolved.orchestrator.clone(), object)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::controlplane::orchestrator::{ApplyQueueConfig, InMemoryOrchestrator};
    use crate::controlplane::secrets::InMemorySecretStore;
    use crate::domain::ports::CredentialPrechecker;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Prechecker accepting one user/password pair
    pub struct StaticPrechecker;

    #[async_trait]
    impl CredentialPrechecker for StaticPrechecker {
        async fn obtain_api_key(
            &self,
            _url: &str,
            user: &str,
            password: &str,
            key_name: &str,
        ) -> Result<String> {
            if user == "admin" && password == "admin" {
                Ok(format!("key-for-{}", key_name))
            } else {
                Err(Error::Credential(
                    "Could not create an API key in PMM: PMM returned an unknown error. HTTP status code 401"
                        .into(),
                ))
            }
        }
    }

    pub struct Harness {
        pub control_plane: ControlPlane,
        pub orchestrator: Arc<InMemoryOrchestrator>,
        pub secrets: Arc<InMemorySecretStore>,
    }

    pub fn harness() -> Harness {
        harness_with(|orchestrator| ScopeResolver::new(orchestrator, Vec::<String>::new()))
    }

    /// Harness whose resolver is built around the in-memory orchestrator
    pub fn harness_with(
        resolver: impl FnOnce(Arc<InMemoryOrchestrator>) -> ScopeResolver,
    ) -> Harness {
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        let metrics = Arc::new(ApiMetrics::new().unwrap());
        let config = ApplyQueueConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..Default::default()
        };
        let (queue, _) = ApplyQueue::start(config, metrics.clone(), CancellationToken::new());
        let control_plane = ControlPlane::new(ControlPlaneDeps {
            resolver: resolver(orchestrator.clone()),
            secrets: secrets.clone(),
            prechecker: Arc::new(StaticPrechecker),
            queue,
            metrics,
        });
        Harness {
            control_plane,
            orchestrator,
            secrets,
        }
    }
}
