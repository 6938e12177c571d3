//! Cross-Reference Checker
//!
//! Each relation between resources carries a policy. Enforced relations must
//! point at an existing resource in the caller's scope; unenforced ones are
//! accepted as-is. A backup storage that does exist must also admit the
//! caller's namespace.
//!
//! Referenced records are leased while a referrer is admitted and committed,
//! so a concurrent delete either sees the referrer or wins before the check.
//! Leases are taken in a fixed order: monitoring instances, backup storages,
//! clusters, then the referrer's own key.

use crate::controlplane::registry::{ResourceKind, ResourceStore, WriteLease};
use crate::controlplane::scope::{ResolvedScope, Scope};
use crate::crd::{DatabaseCluster, DatabaseClusterBackup, DatabaseClusterRestore};
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Whether a dangling reference is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Enforced,
    Unenforced,
}

/// A reference from one resource kind to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    RestoreToCluster,
    RestoreToBackup,
    RestoreToBackupStorage,
    BackupToCluster,
    BackupToBackupStorage,
    ClusterToMonitoringInstance,
    ClusterToBackupStorage,
}

impl Relation {
    pub const fn policy(&self) -> Policy {
        match self {
            Relation::RestoreToCluster | Relation::ClusterToMonitoringInstance => Policy::Enforced,
            Relation::RestoreToBackup
            | Relation::RestoreToBackupStorage
            | Relation::BackupToCluster
            | Relation::BackupToBackupStorage
            | Relation::ClusterToBackupStorage => Policy::Unenforced,
        }
    }

    /// Kind the reference points at
    pub const fn target(&self) -> ResourceKind {
        match self {
            Relation::RestoreToCluster | Relation::BackupToCluster => ResourceKind::DatabaseCluster,
            Relation::RestoreToBackup => ResourceKind::DatabaseClusterBackup,
            Relation::RestoreToBackupStorage
            | Relation::BackupToBackupStorage
            | Relation::ClusterToBackupStorage => ResourceKind::BackupStorage,
            Relation::ClusterToMonitoringInstance => ResourceKind::MonitoringInstance,
        }
    }
}

/// Names a resource points at, grouped by the registry holding them
#[derive(Debug, Default)]
pub struct Referenced {
    pub monitoring_instances: BTreeSet<String>,
    pub backup_storages: BTreeSet<String>,
    pub clusters: BTreeSet<String>,
}

/// Leases on referenced records; released on drop
#[derive(Debug)]
pub struct ReferenceLeases {
    _leases: Vec<WriteLease>,
}

impl Referenced {
    pub fn of_cluster(cluster: &DatabaseCluster) -> Self {
        Self {
            monitoring_instances: cluster
                .monitoring_instance()
                .map(str::to_string)
                .into_iter()
                .collect(),
            backup_storages: cluster.backup_storage_names().into_iter().collect(),
            clusters: BTreeSet::new(),
        }
    }

    pub fn of_backup(backup: &DatabaseClusterBackup) -> Self {
        Self {
            monitoring_instances: BTreeSet::new(),
            backup_storages: BTreeSet::from([backup.spec.backup_storage_name.clone()]),
            clusters: BTreeSet::from([backup.spec.db_cluster_name.clone()]),
        }
    }

    pub fn of_restore(restore: &DatabaseClusterRestore) -> Self {
        Self {
            monitoring_instances: BTreeSet::new(),
            backup_storages: restore
                .backup_storage_name()
                .map(str::to_string)
                .into_iter()
                .collect(),
            clusters: BTreeSet::from([restore.spec.db_cluster_name.clone()]),
        }
    }

    /// Lease every referenced key, clusters in the referrer's partition
    pub async fn lease(&self, store: &ResourceStore, scope: &Scope) -> ReferenceLeases {
        let mut leases = Vec::new();
        for name in &self.monitoring_instances {
            leases.push(store.monitoring_instances.lock(&Scope::Global, name).await);
        }
        for name in &self.backup_storages {
            leases.push(store.backup_storages.lock(&Scope::Global, name).await);
        }
        for name in &self.clusters {
            leases.push(store.clusters.lock(scope, name).await);
        }
        ReferenceLeases { _leases: leases }
    }
}

/// Resolves references against the registry
pub struct ReferenceChecker<'a> {
    store: &'a ResourceStore,
}

impl<'a> ReferenceChecker<'a> {
    pub fn new(store: &'a ResourceStore) -> Self {
        Self { store }
    }

    /// Check one reference under its relation's policy
    pub fn check(&self, scope: &ResolvedScope, relation: Relation, name: &str) -> Result<()> {
        let target = relation.target();
        let exists = match target {
            ResourceKind::DatabaseCluster => self.store.clusters.contains(&scope.scope, name),
            ResourceKind::DatabaseClusterBackup => self.store.backups.contains(&scope.scope, name),
            ResourceKind::DatabaseClusterRestore => {
                self.store.restores.contains(&scope.scope, name)
            }
            ResourceKind::MonitoringInstance => {
                self.store.monitoring_instances.contains(&Scope::Global, name)
            }
            ResourceKind::BackupStorage => {
                match self.store.backup_storages.find(&Scope::Global, name) {
                    Some(entry) if !entry.record.admits_namespace(&scope.namespace) => {
                        return Err(Error::Validation(format!(
                            "BackupStorage '{}' is not available in namespace '{}'",
                            name, scope.namespace
                        )));
                    }
                    Some(_) => true,
                    None => false,
                }
            }
        };

        if exists || relation.policy() == Policy::Unenforced {
            Ok(())
        } else {
            Err(Error::ReferenceNotFound {
                kind: target.to_string(),
                name: name.to_string(),
            })
        }
    }

    pub fn check_cluster(&self, scope: &ResolvedScope, cluster: &DatabaseCluster) -> Result<()> {
        if let Some(instance) = cluster.monitoring_instance() {
            self.check(scope, Relation::ClusterToMonitoringInstance, instance)?;
        }
        for storage in cluster.backup_storage_names() {
            self.check(scope, Relation::ClusterToBackupStorage, &storage)?;
        }
        Ok(())
    }

    pub fn check_backup(&self, scope: &ResolvedScope, backup: &DatabaseClusterBackup) -> Result<()> {
        self.check(scope, Relation::BackupToCluster, &backup.spec.db_cluster_name)?;
        self.check(
            scope,
            Relation::BackupToBackupStorage,
            &backup.spec.backup_storage_name,
        )
    }

    /// On update only a changed target cluster is checked again
    pub fn check_restore(
        &self,
        scope: &ResolvedScope,
        restore: &DatabaseClusterRestore,
        previous: Option<&DatabaseClusterRestore>,
    ) -> Result<()> {
        let cluster = &restore.spec.db_cluster_name;
        let cluster_changed = previous.map_or(true, |p| &p.spec.db_cluster_name != cluster);
        if cluster_changed {
            self.check(scope, Relation::RestoreToCluster, cluster)?;
        }
        if let Some(backup) = restore.spec.data_source.db_cluster_backup_name.as_deref() {
            self.check(scope, Relation::RestoreToBackup, backup)?;
        }
        if let Some(storage) = restore.backup_storage_name() {
            self.check(scope, Relation::RestoreToBackupStorage, storage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::orchestrator::InMemoryOrchestrator;
    use crate::controlplane::registry::BackupStorageRecord;
    use crate::crd::{DatabaseClusterBackupSpec, DatabaseClusterRestoreSpec, RestoreDataSource};
    use crate::domain::ports::SecretRef;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn scope(namespace: &str) -> ResolvedScope {
        ResolvedScope {
            scope: Scope::Namespace(namespace.into()),
            namespace: namespace.into(),
            orchestrator: Arc::new(InMemoryOrchestrator::new()),
        }
    }

    fn restore(cluster: &str) -> DatabaseClusterRestore {
        DatabaseClusterRestore::new(
            "restore",
            DatabaseClusterRestoreSpec {
                db_cluster_name: cluster.into(),
                data_source: RestoreDataSource {
                    db_cluster_backup_name: Some("missing-backup".into()),
                    backup_source: None,
                },
            },
        )
    }

    #[test]
    fn test_policy_table() {
        assert_eq!(Relation::RestoreToCluster.policy(), Policy::Enforced);
        assert_eq!(Relation::ClusterToMonitoringInstance.policy(), Policy::Enforced);
        assert_eq!(Relation::RestoreToBackup.policy(), Policy::Unenforced);
        assert_eq!(Relation::BackupToCluster.policy(), Policy::Unenforced);
        assert_eq!(Relation::BackupToBackupStorage.policy(), Policy::Unenforced);
    }

    #[test]
    fn test_restore_requires_cluster() {
        let store = ResourceStore::new();
        let checker = ReferenceChecker::new(&store);
        let err = checker
            .check_restore(&scope("team-a"), &restore("not-existing-cluster"), None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "DatabaseCluster 'not-existing-cluster' is not found"
        );

        // unchanged cluster is not re-checked on update
        let previous = restore("not-existing-cluster");
        assert!(checker
            .check_restore(
                &scope("team-a"),
                &restore("not-existing-cluster"),
                Some(&previous)
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_backup_storage_target_namespaces() {
        let store = ResourceStore::new();
        let lease = store.backup_storages.lock(&Scope::Global, "s3-a").await;
        store
            .backup_storages
            .create(
                &lease,
                BackupStorageRecord {
                    name: "s3-a".into(),
                    storage_type: "s3".into(),
                    description: None,
                    url: None,
                    bucket_name: "bucket".into(),
                    region: Some("us-east-1".into()),
                    access_key_id: SecretRef::from("a.v1"),
                    secret_key_id: SecretRef::from("b.v2"),
                    target_namespaces: vec!["team-a".into()],
                },
            )
            .unwrap();
        drop(lease);

        let checker = ReferenceChecker::new(&store);
        let backup = DatabaseClusterBackup::new(
            "b1",
            DatabaseClusterBackupSpec {
                db_cluster_name: "missing".into(),
                backup_storage_name: "s3-a".into(),
            },
        );
        assert!(checker.check_backup(&scope("team-a"), &backup).is_ok());
        assert_matches!(
            checker.check_backup(&scope("team-b"), &backup),
            Err(Error::Validation(_))
        );

        let dangling = DatabaseClusterBackup::new(
            "b2",
            DatabaseClusterBackupSpec {
                db_cluster_name: "missing".into(),
                backup_storage_name: "nowhere".into(),
            },
        );
        assert!(checker.check_backup(&scope("team-b"), &dangling).is_ok());
    }
}
